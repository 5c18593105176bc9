use std::error::Error;
use std::fmt::{Display, Formatter};

/// Broad classes of failure the control core reports.
/// Callers branch on these; the message is for humans and logs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParam,
    NotInitialized,
    HardwareFault,
    Timeout,
    SafetyViolation,
    OutOfRange,
    CommFailure,
    BufferOverflow,
    NotArmed,
    FailsafeActive,
    LowBattery,
    ResourceExhausted,
    InvalidState,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuError {
    kind: ErrorKind,
    message: String,
    context: Option<String>,
}

impl Display for TuError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let context_str = match &self.context {
            Some(c) => c.to_string(),
            None => "None".to_string(),
        };
        write!(
            f,
            "[{:?}] {}\n   context:{}",
            self.kind, self.message, context_str
        )
    }
}

impl Error for TuError {}

impl From<&str> for TuError {
    fn from(s: &str) -> TuError {
        TuError {
            kind: ErrorKind::Other,
            message: s.to_string(),
            context: None,
        }
    }
}

impl From<String> for TuError {
    fn from(s: String) -> TuError {
        TuError {
            kind: ErrorKind::Other,
            message: s,
            context: None,
        }
    }
}

impl TuError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> TuError {
        TuError {
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn new_with_cause(message: &str, cause: impl Error) -> TuError {
        TuError {
            kind: ErrorKind::Other,
            message: message.to_string(),
            context: Some(cause.to_string()),
        }
    }

    pub fn add_context(mut self, context: &str) -> TuError {
        self.context = Some(context.into());
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> TuError {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

// Generic Result type for the control stack.
pub type TuResult<T> = Result<T, TuError>;
