use std::result;

use thiserror::Error;

/// Custom result type for engine operations
pub type Result<T> = result::Result<T, Error>;

/// Engine error taxonomy, named after the storage model's exception names
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Malformed call arguments
    #[error("TypeError: {0}")]
    Type(String),
    /// Key conversion or validation failed
    #[error("DataError: {0}")]
    Data(String),
    /// Uniqueness or duplicate-key violation
    #[error("ConstraintError: {0}")]
    Constraint(String),
    /// Operation on a deleted store, index or exhausted cursor
    #[error("InvalidStateError: {0}")]
    InvalidState(String),
    /// Operation not supported for the given object
    #[error("InvalidAccessError: {0}")]
    InvalidAccess(String),
    /// Request issued outside the transaction's active window
    #[error("TransactionInactiveError: {0}")]
    TransactionInactive(String),
    /// Write attempted in a readonly transaction
    #[error("ReadOnlyError: {0}")]
    ReadOnly(String),
    /// Referenced store or index does not exist
    #[error("NotFoundError: {0}")]
    NotFound(String),
    /// Requested version is lower than the stored one
    #[error("VersionError: {0}")]
    Version(String),
    /// The owning transaction was aborted
    #[error("AbortError: {0}")]
    Abort(String),
    /// Invalid key path
    #[error("SyntaxError: {0}")]
    Syntax(String),
    /// Transport failure on the remote boundary
    #[error("RpcError: {0}")]
    Rpc(String),
    /// Wire payload could not be encoded or decoded
    #[error("SerializationError: {0}")]
    Serialization(String),
}

impl Error {
    pub fn data() -> Self {
        Error::Data("Data provided to an operation does not meet requirements.".into())
    }

    pub fn constraint() -> Self {
        Error::Constraint(
            "A mutation operation in the transaction failed because a constraint was not satisfied."
                .into(),
        )
    }

    pub fn invalid_state() -> Self {
        Error::InvalidState(
            "An operation was called on an object on which it is not allowed or at a time when it is not allowed."
                .into(),
        )
    }

    pub fn transaction_inactive() -> Self {
        Error::TransactionInactive(
            "A request was placed against a transaction which is currently not active, or which is finished."
                .into(),
        )
    }

    pub fn read_only() -> Self {
        Error::ReadOnly(
            "The mutating operation was attempted in a \"readonly\" transaction.".into(),
        )
    }

    pub fn not_found() -> Self {
        Error::NotFound(
            "The operation failed because the requested database object could not be found."
                .into(),
        )
    }

    pub fn version() -> Self {
        Error::Version(
            "An attempt was made to open a database using a lower version than the existing version."
                .into(),
        )
    }

    pub fn abort() -> Self {
        Error::Abort("A request was aborted.".into())
    }

    pub fn syntax() -> Self {
        Error::Syntax("The keypath argument contains an invalid key path.".into())
    }

    /// Canonical name used on the wire and in events
    pub fn name(&self) -> &'static str {
        match self {
            Error::Type(_) => "TypeError",
            Error::Data(_) => "DataError",
            Error::Constraint(_) => "ConstraintError",
            Error::InvalidState(_) => "InvalidStateError",
            Error::InvalidAccess(_) => "InvalidAccessError",
            Error::TransactionInactive(_) => "TransactionInactiveError",
            Error::ReadOnly(_) => "ReadOnlyError",
            Error::NotFound(_) => "NotFoundError",
            Error::Version(_) => "VersionError",
            Error::Abort(_) => "AbortError",
            Error::Syntax(_) => "SyntaxError",
            Error::Rpc(_) => "RpcError",
            Error::Serialization(_) => "SerializationError",
        }
    }

    /// The human readable part, without the name prefix
    pub fn message(&self) -> &str {
        match self {
            Error::Type(m)
            | Error::Data(m)
            | Error::Constraint(m)
            | Error::InvalidState(m)
            | Error::InvalidAccess(m)
            | Error::TransactionInactive(m)
            | Error::ReadOnly(m)
            | Error::NotFound(m)
            | Error::Version(m)
            | Error::Abort(m)
            | Error::Syntax(m)
            | Error::Rpc(m)
            | Error::Serialization(m) => m,
        }
    }

    /// Rebuild an error reported by the remote side
    pub fn from_name(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            "TypeError" => Error::Type(message),
            "DataError" => Error::Data(message),
            "ConstraintError" => Error::Constraint(message),
            "InvalidStateError" => Error::InvalidState(message),
            "InvalidAccessError" => Error::InvalidAccess(message),
            "TransactionInactiveError" => Error::TransactionInactive(message),
            "ReadOnlyError" => Error::ReadOnly(message),
            "NotFoundError" => Error::NotFound(message),
            "VersionError" => Error::Version(message),
            "AbortError" => Error::Abort(message),
            "SyntaxError" => Error::Syntax(message),
            "SerializationError" => Error::Serialization(message),
            _ => Error::Rpc(format!("{}: {}", name, message)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_names_map_back() {
        let err = Error::constraint();
        let rebuilt = Error::from_name(err.name(), err.message());
        assert_eq!(rebuilt, err);

        let unknown = Error::from_name("QuotaExceededError", "full");
        assert_eq!(unknown.name(), "RpcError");
    }
}
