use gatehouse_locks::LockManagerError;
use thiserror::Error;

/// Errors returned by the in-memory lock manager.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The resource id was empty.
    #[error("resource id must not be empty")]
    EmptyResourceId,
}

impl LockManagerError for Error {}
