/*!

Platform-independent error model for the daemon core.

There is an escape hatch here for surfacing platform-specific
error information returned by the underlying SQL engine, but the
concrete objects returned must be `Send` so they can be moved from
one thread to another.
 */

pub type PlatformError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
/// Each variant of the `Error` enum provides a summary of the error.
/// More details, if relevant, are contained in the associated value,
/// which may be platform-specific.
///
/// This enum is non-exhaustive so that more values can be added to it
/// without a SemVer break. Clients should always have default handling
/// for variants they don't understand.
#[non_exhaustive]
pub enum Error {
    /// The store has not been opened (or was already closed).
    NotOpen,
    /// The underlying SQL engine could not be reached or opened.
    ConnectionFailure(PlatformError),
    /// A prepared statement or transaction failed to execute.
    StatementFailure(PlatformError),
    /// The database file is locked by another writer; the caller MAY retry.
    Locked,
    /// An unclassified store failure.
    Unknown(PlatformError),
    /// No identity exists with the given id.
    NotFound,
    /// An identity already exists where a new one was expected.
    AlreadyExists,
    /// One of the arguments given to an operation was invalid.
    InvalidArgument(String, String),
    /// The peer's security context is not authorized for this operation.
    PermissionDenied,
    /// The requested mechanism is not in the session's allowed set.
    MechanismNotAvailable(String),
    /// The session was canceled, either while queued or while active.
    SessionCanceled,
    /// The call is not valid for the session's current state.
    WrongState(&'static str),
    /// The plugin requires interactive user input to proceed.
    UserInteraction,
    /// The plugin worker process terminated unexpectedly.
    PluginCrashed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Clone for Error {
    /// Platform errors lose their concrete type across the clone (they're
    /// `dyn Error`, not `Clone`); their message is preserved via `Display`.
    /// Needed because the plugin proxy delivers the same crash/cancel
    /// error to every queued session.
    fn clone(&self) -> Self {
        match self {
            Error::NotOpen => Error::NotOpen,
            Error::ConnectionFailure(e) => Error::ConnectionFailure(Box::from(e.to_string())),
            Error::StatementFailure(e) => Error::StatementFailure(Box::from(e.to_string())),
            Error::Locked => Error::Locked,
            Error::Unknown(e) => Error::Unknown(Box::from(e.to_string())),
            Error::NotFound => Error::NotFound,
            Error::AlreadyExists => Error::AlreadyExists,
            Error::InvalidArgument(a, b) => Error::InvalidArgument(a.clone(), b.clone()),
            Error::PermissionDenied => Error::PermissionDenied,
            Error::MechanismNotAvailable(m) => Error::MechanismNotAvailable(m.clone()),
            Error::SessionCanceled => Error::SessionCanceled,
            Error::WrongState(s) => Error::WrongState(s),
            Error::UserInteraction => Error::UserInteraction,
            Error::PluginCrashed => Error::PluginCrashed,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotOpen => write!(f, "store is not open"),
            Error::ConnectionFailure(err) => write!(f, "could not open store: {err}"),
            Error::StatementFailure(err) => write!(f, "statement failed: {err}"),
            Error::Locked => write!(f, "store is locked by another writer"),
            Error::Unknown(err) => write!(f, "unknown store failure: {err}"),
            Error::NotFound => write!(f, "no matching identity found"),
            Error::AlreadyExists => write!(f, "identity already exists"),
            Error::InvalidArgument(arg, reason) => {
                write!(f, "argument {arg} is invalid: {reason}")
            }
            Error::PermissionDenied => write!(f, "peer is not authorized for this identity"),
            Error::MechanismNotAvailable(mechanism) => {
                write!(f, "mechanism {mechanism} is not available for this session")
            }
            Error::SessionCanceled => write!(f, "session was canceled"),
            Error::WrongState(state) => write!(f, "session is not valid in state {state}"),
            Error::UserInteraction => write!(f, "plugin requires user interaction"),
            Error::PluginCrashed => write!(f, "plugin worker process crashed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ConnectionFailure(err) => Some(err.as_ref()),
            Error::StatementFailure(err) => Some(err.as_ref()),
            Error::Unknown(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                Error::Locked
            }
            rusqlite::Error::SqliteFailure(_, _) => Error::StatementFailure(Box::new(err)),
            other => Error::Unknown(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_does_not_panic() {
        for err in [
            Error::NotOpen,
            Error::Locked,
            Error::NotFound,
            Error::AlreadyExists,
            Error::PermissionDenied,
            Error::SessionCanceled,
            Error::UserInteraction,
            Error::PluginCrashed,
        ] {
            let _ = format!("{err}");
        }
    }

    #[test]
    fn test_locked_classification() {
        let sqlite_err = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
        let err: Error = rusqlite::Error::SqliteFailure(sqlite_err, None).into();
        assert!(matches!(err, Error::Locked));
    }
}
