//! Branch manager
//!
//! In branch mode the "dev" side of a sync is a development branch of the
//! production project, authenticated with the master tokens instead of
//! the primary API token. The branch is located by its deterministic name
//! or created once; re-running never creates duplicates.

use log::info;

use crate::api::{ApiError, EnvironmentClient, ProjectRef};
use crate::config::MasterTokens;

/// Deterministic name marking the branch this engine owns
pub const DEV_BRANCH_NAME: &str = "dev-sync";
const DEV_BRANCH_DESCRIPTION: &str = "Development branch managed by the DEV/PROD sync application";

/// Locate or create the development branch of the production project and
/// expose it as an ordinary project ref
pub async fn ensure_dev_branch(
    client: &dyn EnvironmentClient,
    prod: &ProjectRef,
    master_tokens: &MasterTokens,
) -> Result<ProjectRef, ApiError> {
    // Branch operations run under the dev master token
    let branch_auth = ProjectRef::new(
        prod.id.clone(),
        master_tokens.dev_token.clone(),
        prod.region,
    );

    let branches = client.list_branches(&branch_auth).await?;
    let branch = match branches
        .into_iter()
        .find(|b| !b.is_default && b.name == DEV_BRANCH_NAME)
    {
        Some(existing) => {
            info!("using existing development branch '{}' ({})", existing.name, existing.id);
            existing
        }
        None => {
            client
                .create_branch(&branch_auth, DEV_BRANCH_NAME, DEV_BRANCH_DESCRIPTION)
                .await?
        }
    };

    Ok(ProjectRef {
        id: prod.id.clone(),
        token: master_tokens.dev_token.clone(),
        region: prod.region,
        branch_id: Some(branch.id),
    })
}
