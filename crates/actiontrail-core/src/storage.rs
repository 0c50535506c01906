use async_trait::async_trait;

use crate::action::Action;
use crate::errors::StorageError;

/// In-process destination for delivered actions.
///
/// A batch is accepted or rejected as a unit; there is no partial result.
/// Actions arrive stamped with the configured tenant (`company_id`).
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn create_many_actions(&self, actions: Vec<Action>) -> Result<usize, StorageError>;
}
