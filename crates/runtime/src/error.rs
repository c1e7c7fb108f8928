use crate::{pattern::PatternError, MValue};
use milk_bytecode::FunctionProto;
use std::{error, fmt, rc::Rc};
use thiserror::Error;

/// The different error types that can be thrown by the Milk runtime
#[derive(Error, Clone)]
#[allow(missing_docs)]
pub(crate) enum ErrorKind {
    #[error("{0}")]
    StringError(String),
    /// An error value thrown by a Milk script
    ///
    /// The value is commonly a string, but Error and PCall pass arbitrary values
    /// through unchanged.
    #[error("{thrown_value}")]
    ScriptError { thrown_value: MValue },
    #[error("bad argument #{index} to '{name}' ({message})")]
    BadArgument {
        index: usize,
        name: String,
        message: String,
    },
    #[error("type assertion failed: expected {expected}, got {actual}")]
    TypeAssertion { expected: String, actual: String },
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("stack overflow")]
    StackOverflow,
    #[error("registry overflow")]
    RegistryOverflow,
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An error thrown by the Milk runtime
///
/// Errors carry a value: script-thrown values propagate unchanged to the nearest
/// protected call, other kinds render as strings. The trace collects the
/// (prototype, instruction) pairs of the frames that were unwound.
#[derive(Clone, Debug)]
pub struct Error {
    pub(crate) error: ErrorKind,
    pub(crate) trace: Vec<ErrorFrame>,
}

impl Error {
    pub(crate) fn new(error: ErrorKind) -> Self {
        Self {
            error,
            trace: Vec::new(),
        }
    }

    /// Initializes an error from a thrown script value
    pub fn from_value(thrown_value: MValue) -> Self {
        Self::new(ErrorKind::ScriptError { thrown_value })
    }

    /// The error as a script value, as seen by PCall
    pub fn value(&self) -> MValue {
        match &self.error {
            ErrorKind::ScriptError { thrown_value } => thrown_value.clone(),
            other => MValue::Str(other.to_string().into()),
        }
    }

    /// Extends the error trace with the given prototype and instruction
    pub(crate) fn extend_trace(&mut self, proto: Rc<FunctionProto>, instruction: u32) {
        self.trace.push(ErrorFrame { proto, instruction });
    }

    /// Modifies string errors to include the given prefix
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        use ErrorKind::StringError;

        self.error = match self.error {
            StringError(message) => StringError(format!("{prefix}: {message}")),
            other => other,
        };

        self
    }

    /// Renders the recorded unwind trace, one frame per line
    pub fn trace_string(&self) -> String {
        let mut result = String::from("stack traceback:");
        for ErrorFrame { proto, instruction } in self.trace.iter() {
            result.push_str(&format!(
                "\n\t{}:{}: in {}",
                proto.source,
                proto.line_at(*instruction as usize),
                proto.name_for_display(),
            ));
        }
        result
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        for ErrorFrame { proto, instruction } in self.trace.iter() {
            write!(
                f,
                "\n--- {}:{}: in {}",
                proto.source,
                proto.line_at(*instruction as usize),
                proto.name_for_display(),
            )?;
        }

        Ok(())
    }
}

impl error::Error for Error {}

impl From<String> for Error {
    fn from(error: String) -> Self {
        Self::new(ErrorKind::StringError(error))
    }
}

impl From<&str> for Error {
    fn from(error: &str) -> Self {
        Self::new(ErrorKind::StringError(error.into()))
    }
}

impl From<ErrorKind> for Error {
    fn from(error: ErrorKind) -> Self {
        Self::new(error)
    }
}

impl From<PatternError> for Error {
    fn from(error: PatternError) -> Self {
        Self::new(ErrorKind::Pattern(error))
    }
}

/// A prototype and instruction pair recorded while unwinding
#[derive(Clone, Debug)]
pub(crate) struct ErrorFrame {
    proto: Rc<FunctionProto>,
    instruction: u32,
}

/// The Result type used by the Milk runtime
pub type Result<T> = std::result::Result<T, Error>;

/// Creates a [crate::Error] from a message (with format-like behaviour), wrapped in `Err`
#[macro_export]
macro_rules! runtime_error {
    ($error:literal) => {
        Err($crate::Error::from(format!($error)))
    };
    ($error:expr) => {
        Err($crate::Error::from($error))
    };
    ($error:literal, $($y:expr),+ $(,)?) => {
        Err($crate::Error::from(format!($error, $($y),+)))
    };
}
