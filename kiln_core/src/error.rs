//! Error types and result definitions for Kiln.
//!
//! One error type covers every failure the runtime core reports:
//! - Managed exceptions thrown by executing code
//! - Class initialization failures (sticky, wrapping the original cause)
//! - Redefinition rejections (verification and unsupported changes)
//! - Access-restricted lookups
//! - Internal consistency failures (fatal)

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The unified result type used throughout Kiln.
pub type KilnResult<T> = Result<T, KilnError>;

/// Well-known exception class names raised by the core itself.
pub mod classes {
    /// Dereference of a null reference.
    pub const NULL_POINTER: &str = "NullPointerException";
    /// Integer division by zero.
    pub const ARITHMETIC: &str = "ArithmeticException";
    /// Array index outside `0..length`.
    pub const ARRAY_INDEX: &str = "ArrayIndexOutOfBoundsException";
    /// Negative length passed to array allocation.
    pub const NEGATIVE_ARRAY_SIZE: &str = "NegativeArraySizeException";
    /// Operand of the wrong kind for an operation.
    pub const CLASS_CAST: &str = "ClassCastException";
    /// Operation not allowed in the caller's current state.
    pub const ILLEGAL_STATE: &str = "IllegalStateException";
}

/// A managed exception: class name plus optional detail message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throwable {
    /// Exception class name.
    pub class: Arc<str>,
    /// Detail message.
    pub message: Option<Arc<str>>,
}

impl Throwable {
    /// Create a throwable with a detail message.
    pub fn new(class: impl Into<Arc<str>>, message: impl Into<Arc<str>>) -> Self {
        Self {
            class: class.into(),
            message: Some(message.into()),
        }
    }

    /// Create a throwable without a detail message.
    pub fn bare(class: impl Into<Arc<str>>) -> Self {
        Self {
            class: class.into(),
            message: None,
        }
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.class, message),
            None => f.write_str(&self.class),
        }
    }
}

/// Why a redefinition request was rejected as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedefinitionFailure {
    /// The new definition names a different type.
    NamesDontMatch,
    /// Superclass or interface list changed.
    HierarchyChanged,
    /// Class-level modifiers changed.
    ModifiersChanged,
    /// Instance or static field layout changed.
    SchemaChanged,
    /// The new definition adds a method.
    MethodAdded,
    /// The new definition removes a method.
    MethodDeleted,
    /// A method's modifiers or arity changed.
    MethodModifiersChanged,
}

impl RedefinitionFailure {
    /// Stable name used in messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NamesDontMatch => "names don't match",
            Self::HierarchyChanged => "hierarchy changed",
            Self::ModifiersChanged => "class modifiers changed",
            Self::SchemaChanged => "schema changed",
            Self::MethodAdded => "method added",
            Self::MethodDeleted => "method deleted",
            Self::MethodModifiersChanged => "method modifiers changed",
        }
    }
}

impl fmt::Display for RedefinitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comprehensive error type covering all Kiln error conditions.
#[derive(Error, Debug, Clone)]
pub enum KilnError {
    /// A managed exception propagating out of executing code.
    #[error("{0}")]
    Exception(Throwable),

    /// Static initialization of a type failed. Sticky: every later
    /// access to the type reports the same cause.
    #[error("InitializationError: {type_name} could not be initialized: {cause}")]
    Initialization {
        /// Name of the type whose initializer failed.
        type_name: Arc<str>,
        /// The original failure.
        cause: Arc<KilnError>,
    },

    /// A definition failed structural verification.
    #[error("VerificationError: {message}")]
    Verification {
        /// Error description.
        message: String,
    },

    /// A redefinition would change something redefinition cannot change.
    #[error("UnsupportedRedefinition ({kind}): {message}")]
    UnsupportedRedefinition {
        /// The rejected change.
        kind: RedefinitionFailure,
        /// Error description.
        message: String,
    },

    /// The runtime's internal invariants are broken. Never recoverable.
    #[error("InternalConsistencyError: {message}")]
    InternalConsistency {
        /// Error description.
        message: String,
    },

    /// A capability-restricted lookup was refused.
    #[error("IllegalAccessError: {message}")]
    IllegalAccess {
        /// Error description.
        message: String,
    },

    /// A method handle was invoked with incompatible arguments.
    #[error("WrongMethodTypeException: {message}")]
    WrongMethodType {
        /// Error description.
        message: String,
    },

    /// A method could not be compiled.
    #[error("CompilationError: {message}")]
    Compilation {
        /// Error description.
        message: String,
    },

    /// A malformed type definition was offered for loading.
    #[error("ClassFormatError: {message}")]
    ClassFormat {
        /// Error description.
        message: String,
    },

    /// A referenced type is not loaded.
    #[error("NoClassDefFoundError: {name}")]
    NoSuchType {
        /// The missing type name.
        name: Arc<str>,
    },

    /// A referenced method does not exist.
    #[error("NoSuchMethodError: {type_name}.{method}")]
    NoSuchMethod {
        /// Type the lookup started from.
        type_name: Arc<str>,
        /// The missing method name.
        method: Arc<str>,
    },

    /// A referenced field does not exist.
    #[error("NoSuchFieldError: {type_name}.{field}")]
    NoSuchField {
        /// Type the lookup started from.
        type_name: Arc<str>,
        /// The missing field name.
        field: Arc<str>,
    },

    /// An object id no longer names a live object.
    #[error("InvalidObject: {id} is not a live object")]
    InvalidObject {
        /// The stale id, as a raw number.
        id: u64,
    },

    /// Call depth exceeded the configured maximum.
    #[error("StackOverflowError: call depth {depth} exceeded")]
    StackOverflow {
        /// The depth reached.
        depth: usize,
    },

    /// Invalid runtime configuration.
    #[error("ConfigError: {message}")]
    Config {
        /// Error description.
        message: String,
    },
}

impl KilnError {
    /// Create a managed exception with a detail message.
    #[must_use]
    pub fn exception(class: impl Into<Arc<str>>, message: impl Into<Arc<str>>) -> Self {
        Self::Exception(Throwable::new(class, message))
    }

    /// Create a `NullPointerException`.
    #[must_use]
    pub fn null_pointer(detail: impl Into<Arc<str>>) -> Self {
        Self::exception(classes::NULL_POINTER, detail)
    }

    /// Create an `IllegalStateException`.
    #[must_use]
    pub fn illegal_state(message: impl Into<Arc<str>>) -> Self {
        Self::exception(classes::ILLEGAL_STATE, message)
    }

    /// Create an `ArithmeticException` for division by zero.
    #[must_use]
    pub fn division_by_zero() -> Self {
        Self::exception(classes::ARITHMETIC, "divide by zero")
    }

    /// Create an `ArrayIndexOutOfBoundsException`.
    #[must_use]
    pub fn array_index(index: i64, length: usize) -> Self {
        Self::exception(
            classes::ARRAY_INDEX,
            format!("length={length}; index={index}"),
        )
    }

    /// Create a `ClassCastException` for an operand of the wrong kind.
    #[must_use]
    pub fn wrong_operand(expected: &str, found: &str) -> Self {
        Self::exception(
            classes::CLASS_CAST,
            format!("expected {expected}, found {found}"),
        )
    }

    /// Create a verification error.
    #[must_use]
    pub fn verification(message: impl Into<String>) -> Self {
        Self::Verification {
            message: message.into(),
        }
    }

    /// Create an unsupported-redefinition error.
    #[must_use]
    pub fn unsupported_redefinition(kind: RedefinitionFailure, message: impl Into<String>) -> Self {
        Self::UnsupportedRedefinition {
            kind,
            message: message.into(),
        }
    }

    /// Create an internal consistency error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalConsistency {
            message: message.into(),
        }
    }

    /// Create an illegal access error.
    #[must_use]
    pub fn illegal_access(message: impl Into<String>) -> Self {
        Self::IllegalAccess {
            message: message.into(),
        }
    }

    /// Create a compilation error.
    #[must_use]
    pub fn compilation(message: impl Into<String>) -> Self {
        Self::Compilation {
            message: message.into(),
        }
    }

    /// Create a class format error.
    #[must_use]
    pub fn class_format(message: impl Into<String>) -> Self {
        Self::ClassFormat {
            message: message.into(),
        }
    }

    /// Create a missing-type error.
    #[must_use]
    pub fn no_such_type(name: impl Into<Arc<str>>) -> Self {
        Self::NoSuchType { name: name.into() }
    }

    /// Create a missing-method error.
    #[must_use]
    pub fn no_such_method(type_name: impl Into<Arc<str>>, method: impl Into<Arc<str>>) -> Self {
        Self::NoSuchMethod {
            type_name: type_name.into(),
            method: method.into(),
        }
    }

    /// Create a missing-field error.
    #[must_use]
    pub fn no_such_field(type_name: impl Into<Arc<str>>, field: impl Into<Arc<str>>) -> Self {
        Self::NoSuchField {
            type_name: type_name.into(),
            field: field.into(),
        }
    }

    /// Create a wrong-method-type error.
    #[must_use]
    pub fn wrong_method_type(message: impl Into<String>) -> Self {
        Self::WrongMethodType {
            message: message.into(),
        }
    }

    /// Create a stale-object error.
    #[must_use]
    pub fn invalid_object(id: crate::ids::ObjectId) -> Self {
        Self::InvalidObject { id: id.as_u64() }
    }

    /// Whether this error leaves the runtime in an unknown state.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InternalConsistency { .. })
    }

    /// The managed exception class, if this is a managed exception.
    #[must_use]
    pub fn exception_class(&self) -> Option<&str> {
        match self {
            Self::Exception(t) => Some(&t.class),
            _ => None,
        }
    }

    /// Follow `Initialization` causes down to the original failure.
    #[must_use]
    pub fn root_cause(&self) -> &KilnError {
        let mut current = self;
        while let Self::Initialization { cause, .. } = current {
            current = cause;
        }
        current
    }
}
