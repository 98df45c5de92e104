use thiserror::Error;

#[derive(Error, Debug)]
pub enum VeaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of space: cannot reserve {requested} blocks")]
    OutOfSpace { requested: u64 },

    /// An in-memory index or persistent table disagrees with itself.
    ///
    /// The pool must be treated as corrupt once this is returned.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("No active transaction")]
    NoTransaction,

    #[error("A transaction is already active")]
    TransactionActive,

    #[error("Invalid magic number in pool image")]
    InvalidMagic,

    #[error("Unsupported format version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Pool image checksum verification failed")]
    ChecksumMismatch,

    #[error("Space is not formatted")]
    NotFormatted,

    #[error("Space is already formatted")]
    AlreadyFormatted,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl VeaError {
    /// Whether the error means the pool can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, VeaError::Integrity(_))
    }

    pub(crate) fn integrity<S: Into<String>>(msg: S) -> Self {
        VeaError::Integrity(msg.into())
    }

    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        VeaError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, VeaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_integrity_is_fatal() {
        assert!(VeaError::integrity("entry in neither heap nor lru").is_fatal());
        assert!(!VeaError::OutOfSpace { requested: 10 }.is_fatal());
        assert!(!VeaError::invalid("zero blocks").is_fatal());
        assert!(!VeaError::TransactionAborted("commit failed".into()).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = VeaError::OutOfSpace { requested: 128 };
        assert_eq!(err.to_string(), "Out of space: cannot reserve 128 blocks");

        let err = VeaError::UnsupportedVersion { major: 9, minor: 1 };
        assert_eq!(err.to_string(), "Unsupported format version: 9.1");
    }
}
