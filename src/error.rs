use thiserror::Error;

/// Main error type for cachet operations.
///
/// Error categories are preserved as values cross component boundaries: the
/// RPC layer translates them into transport status codes, the HTTP layer
/// collapses them all into a 500, and the registry logs and swallows them.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation requires the cluster leader; retry against it.
    #[error("not leader")]
    NotLeader,

    #[error("trying to join self")]
    JoiningSelf,

    #[error("no communication available for clients")]
    NoCommunication,

    /// A log entry could not be decoded. Indicates corruption; not retriable.
    #[error("malformed log entry: {0}")]
    MalformedEntry(String),

    #[error("apply deadline exceeded")]
    Timeout,

    /// Opaque consensus-library failure not classified above.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// Apply-time byte-cache failure, returned to the caller of set/get.
    #[error("cache error: {0}")]
    Cache(String),

    /// The client picker had no ready connection for the requested method.
    #[error("no subchannel available")]
    NoSubConnAvailable,

    #[error("invalid address: {0}")]
    InvalidAddr(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for cachet operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a retry, possibly against another node, could succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader | Error::Timeout | Error::Consensus(_) | Error::Transport(_)
        )
    }
}

impl From<Error> for tonic::Status {
    fn from(e: Error) -> Self {
        match &e {
            Error::NotLeader => tonic::Status::failed_precondition(e.to_string()),
            Error::Timeout => tonic::Status::deadline_exceeded(e.to_string()),
            Error::JoiningSelf | Error::InvalidAddr(_) => {
                tonic::Status::invalid_argument(e.to_string())
            }
            Error::MalformedEntry(_) => tonic::Status::data_loss(e.to_string()),
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}
