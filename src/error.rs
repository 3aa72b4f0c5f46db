use thiserror::Error;

use crate::config::ConfigError;
use crate::queue::QueueError;
use crate::repository::RepoError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the module errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
