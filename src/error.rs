//! Core error types.

/// Errors from whitelist, PIN, override, and timer operations.
///
/// These are the outcomes callers are expected to match on and, for the
/// PIN variants, present directly to the end user.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// No persisted snapshot was found under the given storage key.
    ///
    /// Whether this is fatal or triggers empty-state initialization is a
    /// deployment choice, see [`crate::config::MissingStatePolicy`].
    #[error("no persisted state found for key '{0}'")]
    Load(String),

    #[error("incorrect pin")]
    IncorrectPin,

    #[error("pin not set, configure a pin before unblocking")]
    PinNotConfigured,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The external authorization channel exceeded its wait budget.
    #[error("authorization timed out after {0} seconds")]
    AuthTimeout(u64),

    /// The authorization backend rejected or failed the request.
    #[error("authorization failed: {0}")]
    AuthFailed(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_user_presentable() {
        assert_eq!(CoreError::IncorrectPin.to_string(), "incorrect pin");
        assert_eq!(
            CoreError::Load("__whitelist".to_string()).to_string(),
            "no persisted state found for key '__whitelist'"
        );
        assert!(CoreError::AuthTimeout(600).to_string().contains("600"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
