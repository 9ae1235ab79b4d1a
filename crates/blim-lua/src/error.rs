//! Script error taxonomy.
//!
//! Every failure that crosses the host/script boundary is reported as a
//! [`ScriptError`]. The [`ErrorKind`] tells the caller where it came from:
//!
//! | Kind | Raised by |
//! |------|-----------|
//! | `syntax` | [`ScriptEngine::load_script`](crate::ScriptEngine::load_script) |
//! | `runtime` | script execution, host faults, cancellation |
//! | `api` | misuse of the host surface (bad arguments, blocked functions) |

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const TRACEBACK_MARKER: &str = "\nstack traceback:";

/// Category of a [`ScriptError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Syntax,
    Runtime,
    Api,
}

impl ErrorKind {
    /// Stable lowercase code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Runtime => "runtime",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution context stopped a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// A panic caught at the host/script boundary.
#[derive(Debug, Clone, Error)]
#[error("host panic: {0}")]
pub struct HostPanic(pub String);

/// Error returned by every fallible engine operation.
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: Option<u32>,
    /// Chunk or function the error originated in.
    pub origin: Option<String>,
    pub stack_trace: Option<String>,
    cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
            origin: None,
            stack_trace: None,
            cause: None,
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Api, message)
    }

    /// Runtime error carrying the interruption reason as its cause.
    pub fn interrupted(reason: Interrupted) -> Self {
        Self::runtime(reason.to_string()).with_cause(reason)
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// The wrapped lower-level error, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Returns `true` if both errors have the same kind.
    #[must_use]
    pub fn same_kind(&self, other: &ScriptError) -> bool {
        self.kind == other.kind
    }

    /// Returns `true` for errors produced by a cancelled or expired context.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cause()
            .and_then(|c| c.downcast_ref::<Interrupted>())
            .is_some()
    }

    /// Converts an `mlua` error raised while running code from `origin`.
    ///
    /// Host errors that were raised as [`ScriptError`] come back unchanged.
    /// Lua messages of the form `<chunk>:<line>: <message>` are split into
    /// their parts, and any `stack traceback:` section becomes the stack trace.
    pub fn from_lua(err: &mlua::Error, origin: &str) -> Self {
        match err {
            mlua::Error::SyntaxError { message, .. } => {
                Self::located(ErrorKind::Syntax, message, origin)
            }
            mlua::Error::RuntimeError(message) => {
                Self::located(ErrorKind::Runtime, message, origin)
            }
            mlua::Error::CallbackError { traceback, cause } => {
                let mut inner = Self::from_lua(cause, origin);
                if inner.stack_trace.is_none() && !traceback.is_empty() {
                    inner.stack_trace = Some(traceback.clone());
                }
                inner
            }
            mlua::Error::ExternalError(external) => {
                if let Some(script) = external.downcast_ref::<ScriptError>() {
                    return script.clone();
                }
                if let Some(reason) = external.downcast_ref::<Interrupted>() {
                    return Self::interrupted(*reason);
                }
                let mut converted = Self::runtime(external.to_string());
                converted.cause = Some(Arc::clone(external));
                converted
            }
            mlua::Error::WithContext { context, cause } => {
                let mut inner = Self::from_lua(cause, origin);
                inner.message = format!("{context}: {}", inner.message);
                inner
            }
            other => Self::located(ErrorKind::Runtime, &other.to_string(), origin),
        }
    }

    fn located(kind: ErrorKind, raw: &str, origin: &str) -> Self {
        let (head, trace) = match raw.find(TRACEBACK_MARKER) {
            Some(at) => (&raw[..at], Some(raw[at + 1..].to_string())),
            None => (raw, None),
        };

        let mut err = match split_location(head) {
            Some((chunk, line, message)) => Self::new(kind, message)
                .with_origin(chunk)
                .with_line(line),
            None => {
                let err = Self::new(kind, head);
                if origin.is_empty() {
                    err
                } else {
                    err.with_origin(origin)
                }
            }
        };
        err.stack_trace = trace;
        err
    }
}

/// Splits `<chunk>:<line>: <message>`.
fn split_location(text: &str) -> Option<(&str, u32, &str)> {
    for (colon, _) in text.match_indices(':') {
        let rest = &text[colon + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || !rest[digits..].starts_with(": ") {
            continue;
        }
        let line = rest[..digits].parse().ok()?;
        return Some((&text[..colon], line, &rest[digits + 2..]));
    }
    None
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.origin, self.line) {
            (Some(origin), Some(line)) => write!(
                f,
                "Lua {} error (in {origin}, line {line}): {}",
                self.kind, self.message
            )?,
            (Some(origin), None) => {
                write!(f, "Lua {} error (in {origin}): {}", self.kind, self.message)?
            }
            (None, Some(line)) => {
                write!(f, "Lua {} error (line {line}): {}", self.kind, self.message)?
            }
            (None, None) => write!(f, "Lua error: {}", self.message)?,
        }
        if let Some(trace) = &self.stack_trace {
            write!(f, "\n{trace}")?;
        }
        Ok(())
    }
}

impl StdError for ScriptError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn StdError + 'static))
    }
}

impl From<ScriptError> for mlua::Error {
    fn from(err: ScriptError) -> Self {
        mlua::Error::external(err)
    }
}
