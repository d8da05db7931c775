use thiserror::Error;

use crate::registry::error::StoreError;

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("approval `{0}` not found")]
    ApprovalNotFound(String),

    #[error("storage error: `{0}`")]
    Store(#[from] StoreError),
}
