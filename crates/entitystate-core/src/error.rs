//! Error types for change tracking operations.

use std::fmt;

/// The primary error type for all entitystate operations.
#[derive(Debug)]
pub enum Error {
    /// The operation is not valid for the current state of an entry or graph
    InvalidOperation(InvalidOperationError),
    /// A caller-supplied argument was invalid (unmapped names, null key values)
    Argument(ArgumentError),
    /// Type conversion errors
    Type(TypeError),
    /// Metadata registration and lookup errors
    Metadata(MetadataError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct InvalidOperationError {
    pub kind: InvalidOperationKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidOperationKind {
    /// Value or relationship access on a key stub
    KeyEntry,
    /// The entry is no longer tracked
    Detached,
    /// The entry state does not permit the operation
    InvalidState,
    /// A changed notification did not match the pending changing notification
    ChangeNotificationMismatch,
    /// An unresolved conceptual null foreign key at commit time
    ConceptualNull,
    /// Fix-up would steal a one-to-one reference from another dependent
    ReferenceSteal,
    /// A complex object instance is used by more than one property
    DuplicateComplexObject,
    /// A complex property was set to null
    NullComplexProperty,
    /// A key member value was changed on a tracked entity
    KeyModified,
    /// Principal and dependent disagree on constrained property values
    ReferentialConstraint,
    /// Another entry is already tracked under the same key or object
    KeyConflict,
    /// Referential constraints form a cycle that cannot be ordered
    CircularConstraint,
    /// The entry still participates in live relationships
    RelatedEntries,
    /// Navigation and foreign key changes disagree
    ConflictingChanges,
}

impl InvalidOperationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            InvalidOperationKind::KeyEntry => "key entry",
            InvalidOperationKind::Detached => "detached",
            InvalidOperationKind::InvalidState => "invalid state",
            InvalidOperationKind::ChangeNotificationMismatch => "change notification mismatch",
            InvalidOperationKind::ConceptualNull => "conceptual null",
            InvalidOperationKind::ReferenceSteal => "reference steal",
            InvalidOperationKind::DuplicateComplexObject => "duplicate complex object",
            InvalidOperationKind::NullComplexProperty => "null complex property",
            InvalidOperationKind::KeyModified => "key modified",
            InvalidOperationKind::ReferentialConstraint => "referential constraint",
            InvalidOperationKind::KeyConflict => "key conflict",
            InvalidOperationKind::CircularConstraint => "circular constraint",
            InvalidOperationKind::RelatedEntries => "related entries",
            InvalidOperationKind::ConflictingChanges => "conflicting changes",
        }
    }
}

#[derive(Debug)]
pub struct ArgumentError {
    /// Name of the offending parameter
    pub parameter: String,
    pub message: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    /// Member name, when the conversion was for a named member
    pub member: Option<String>,
}

#[derive(Debug)]
pub struct MetadataError {
    pub kind: MetadataErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    /// Name does not match the identifier pattern
    InvalidIdentifier,
    /// Name registered twice
    Duplicate,
    /// Entity set not registered
    UnknownEntitySet,
    /// Association set not registered
    UnknownAssociation,
    /// Member, role or navigation property not declared
    UnknownMember,
    /// Structurally invalid definition (key on complex member, bad constraint)
    InvalidDefinition,
}

impl Error {
    /// Build an invalid-operation error.
    pub fn invalid_operation(kind: InvalidOperationKind, message: impl Into<String>) -> Self {
        Error::InvalidOperation(InvalidOperationError {
            kind,
            message: message.into(),
        })
    }

    /// Build an argument error.
    pub fn argument(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Argument(ArgumentError {
            parameter: parameter.into(),
            message: message.into(),
        })
    }

    /// Build a metadata error.
    pub fn metadata(kind: MetadataErrorKind, message: impl Into<String>) -> Self {
        Error::Metadata(MetadataError {
            kind,
            message: message.into(),
        })
    }

    /// Is this an invalid-operation error?
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Error::InvalidOperation(_))
    }

    /// Is this an argument error?
    pub fn is_argument(&self) -> bool {
        matches!(self, Error::Argument(_))
    }

    /// Kind of an invalid-operation error, if this is one.
    pub fn invalid_operation_kind(&self) -> Option<InvalidOperationKind> {
        match self {
            Error::InvalidOperation(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Kind of a metadata error, if this is one.
    pub fn metadata_kind(&self) -> Option<MetadataErrorKind> {
        match self {
            Error::Metadata(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidOperation(e) => {
                write!(f, "Invalid operation ({}): {}", e.kind.as_str(), e.message)
            }
            Error::Argument(e) => write!(f, "Invalid argument '{}': {}", e.parameter, e.message),
            Error::Type(e) => {
                if let Some(member) = &e.member {
                    write!(
                        f,
                        "Type error in member '{}': expected {}, found {}",
                        member, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Metadata(e) => write!(f, "Metadata error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for InvalidOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.parameter, self.message)
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<InvalidOperationError> for Error {
    fn from(err: InvalidOperationError) -> Self {
        Error::InvalidOperation(err)
    }
}

impl From<ArgumentError> for Error {
    fn from(err: ArgumentError) -> Self {
        Error::Argument(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

/// Result type alias for entitystate operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_operation_helpers() {
        let err = Error::invalid_operation(InvalidOperationKind::KeyEntry, "stub");
        assert!(err.is_invalid_operation());
        assert!(!err.is_argument());
        assert_eq!(
            err.invalid_operation_kind(),
            Some(InvalidOperationKind::KeyEntry)
        );
        assert_eq!(err.to_string(), "Invalid operation (key entry): stub");
    }

    #[test]
    fn test_argument_display() {
        let err = Error::argument("name", "'Nope' is not a mapped member");
        assert!(err.is_argument());
        assert_eq!(err.invalid_operation_kind(), None);
        assert_eq!(
            err.to_string(),
            "Invalid argument 'name': 'Nope' is not a mapped member"
        );
    }

    #[test]
    fn test_type_error_display() {
        let err = Error::Type(TypeError {
            expected: "i64",
            actual: "TEXT".to_string(),
            member: Some("Total".to_string()),
        });
        assert_eq!(
            err.to_string(),
            "Type error in member 'Total': expected i64, found TEXT"
        );
    }

    #[test]
    fn test_metadata_kind() {
        let err = Error::metadata(MetadataErrorKind::UnknownEntitySet, "no set 'Orders'");
        assert_eq!(err.metadata_kind(), Some(MetadataErrorKind::UnknownEntitySet));
        assert_eq!(err.to_string(), "Metadata error: no set 'Orders'");
    }
}
