use crate::table::TableId;

/// Boxed error type used to carry driver and application failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to send or receive command to/from background thread")]
    Command,
    #[error("Failed to create background thread: {0}")]
    Thread(std::io::Error),
    #[error("Table id {0} is not part of the database schema")]
    UnknownTable(TableId),
    #[error("Sql error: {0}")]
    Sql(BoxError),
    #[error("Transaction failed: {0}")]
    Failed(BoxError),
    #[error("Transaction panicked: {0}")]
    Panicked(String),
    #[error("Transaction was cancelled before it could run")]
    Cancelled,
    #[error("Transaction dispatcher has been shut down")]
    Closed,
}

impl Error {
    /// Wrap a driver error.
    pub fn sql(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Sql(Box::new(err))
    }

    /// Wrap an application error raised by a unit of work.
    pub fn failed(err: impl Into<BoxError>) -> Self {
        Self::Failed(err.into())
    }

    /// Whether this error means the unit of work never ran.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Closed)
    }
}

#[cfg(feature = "rusqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::sql(value)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
