use crate::id::{PageId, VolNo};
use crate::lock::LockResource;

/// Errors surfaced by every storage operation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A caller-supplied argument is outside the operation's contract.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The lock manager refused a request. Not retried at this layer.
    #[error("deadlock while requesting lock on {resource}")]
    Deadlock { resource: LockResource },

    /// Page I/O, allocation or log failure.
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("volume {0} is not mounted")]
    NotMounted(VolNo),

    /// No split domain divides the directory page.
    #[error("directory page {0} cannot be split on any domain")]
    Unsplittable(PageId),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.into())
    }
}

impl Error {
    pub(crate) fn bad_parameter(msg: impl Into<String>) -> Self {
        Error::BadParameter(msg.into())
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, Error::Deadlock { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
