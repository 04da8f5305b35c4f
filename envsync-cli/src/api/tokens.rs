//! Per-project storage token provisioning cache
//!
//! Sync runs authenticate against each project with short-lived storage
//! tokens provisioned through the manage API. Tokens are cached in the
//! platform state file between runs and re-provisioned once they are
//! expired or about to expire.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A token is considered expired this long before its actual expiry, so a
/// run never starts with a token that dies mid-run.
const EXPIRY_SLACK_SECS: i64 = 10 * 60;

/// One provisioned storage token, as persisted in the state file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageToken {
    pub id: String,
    #[serde(rename = "#token")]
    pub token: String,
    #[serde(default)]
    pub expires: String,
}

impl StorageToken {
    pub fn new(
        id: impl Into<String>,
        token: impl Into<String>,
        expires: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            expires: expires.into(),
        }
    }

    /// Expired means: no parseable expiry, or expiry within the slack window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => (expires_at - now).num_seconds() <= EXPIRY_SLACK_SECS,
            None => true,
        }
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expires.is_empty() {
            return None;
        }
        DateTime::parse_from_rfc3339(&self.expires)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Token cache keyed by project cache key (`{region}-{project_id}`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenCache {
    tokens: HashMap<String, StorageToken>,
}

impl TokenCache {
    /// Return a cached token that is still usable at `now`
    pub fn get_valid(&self, key: &str, now: DateTime<Utc>) -> Option<&StorageToken> {
        self.tokens.get(key).filter(|t| !t.is_expired(now))
    }

    pub fn insert(&mut self, key: impl Into<String>, token: StorageToken) {
        self.tokens.insert(key.into(), token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
