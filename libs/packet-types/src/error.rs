/// Error taxonomy shared by every control API in the workspace.
///
/// Hot paths never construct these; they surface drops through counters.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found")]
    NotFound,
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("already exists")]
    AlreadyExists,
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("transport error ({0})")]
    Transport(i32),
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::Io(e.to_string())
    }
}
