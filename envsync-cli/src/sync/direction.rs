//! Sync direction resolution
//!
//! The `mode` setting fixes which project is source and which is target
//! for the whole run. It arrives pre-substituted; only the two literal
//! modes are valid.

use crate::api::RunError;

pub const PROD_TO_DEV_MODE: &str = "prod_to_dev";
pub const DEV_TO_PROD_MODE: &str = "dev_to_prod";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    ProdToDev,
    DevToProd,
}

impl SyncDirection {
    /// Resolve the `mode` setting into a direction
    pub fn resolve(mode: &str) -> Result<Self, RunError> {
        match mode.trim() {
            PROD_TO_DEV_MODE => Ok(Self::ProdToDev),
            DEV_TO_PROD_MODE => Ok(Self::DevToProd),
            other => Err(RunError::Configuration(format!(
                "mode '{}' is invalid, supported modes are '{}' and '{}'",
                other, DEV_TO_PROD_MODE, PROD_TO_DEV_MODE
            ))),
        }
    }

    /// Direction tag used in change descriptions
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ProdToDev => "SYNC FROM PROD",
            Self::DevToProd => "SYNC FROM DEV",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProdToDev => PROD_TO_DEV_MODE,
            Self::DevToProd => DEV_TO_PROD_MODE,
        }
    }
}
