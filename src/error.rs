use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Look through an `anyhow` chain for a typed pipeline error
    pub fn find(err: &anyhow::Error) -> Option<&Error> {
        err.chain().find_map(|cause| cause.downcast_ref::<Error>())
    }

    /// Whether the error is a Registry "not found" answer
    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(Error::NotFound(_)))
    }

    /// Whether the error reports a concurrent modification
    pub fn is_conflict(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(Error::Conflict(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classifies_wrapped_errors() {
        let err: anyhow::Result<()> = Err(Error::Conflict("device D1".into()).into());
        let err = err.context("writing device").unwrap_err();
        assert!(Error::is_conflict(&err));
        assert!(!Error::is_not_found(&err));

        let plain = anyhow::anyhow!("connection reset");
        assert!(Error::find(&plain).is_none());
    }
}
