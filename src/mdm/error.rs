use thiserror::Error;

/// Errors from the command/response boundary codec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// A workflow command carried an empty command UUID.
    #[error("empty command uuid")]
    EmptyCommandUuid,

    /// A workflow command carried an empty request type.
    #[error("empty request type")]
    EmptyRequestType,

    /// No parser is registered for the response's request type.
    #[error("no response type for request type: {0}")]
    UnknownRequestType(String),

    /// Property list (de)serialization failed.
    #[error("property list error")]
    Plist(#[from] plist::Error),

    /// A workflow step context failed to marshal or unmarshal.
    #[error("context marshal error")]
    Context(#[source] crate::BoxError),

    /// A step result must target exactly one enrollment id.
    #[error("incorrect id count in step result")]
    IncorrectIdCount,
}

pub type Result<T> = std::result::Result<T, CodecError>;
