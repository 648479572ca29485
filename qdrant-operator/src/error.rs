//! Operator-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[source] kube::Error),

    #[error("failed to write status: {0}")]
    Status(#[from] crate::status::Error),

    #[error("vector database request failed: {0}")]
    Qdrant(#[from] crate::qdrant::Error),

    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] qdrant_operator_api::InvalidSpec),

    #[error("failed to serialize manifest: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::Kube(err)
    }
}

impl Error {
    /// Label used for the `errors_total` metric.
    #[must_use]
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::Kube(_) => "kube",
            Error::Status(_) => "status",
            Error::Qdrant(_) => "qdrant",
            Error::InvalidSpec(_) => "invalid_spec",
            Error::Serialization(_) => "serialization",
            Error::MissingObjectKey(_) => "missing_object_key",
            Error::Io(_) => "io",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
