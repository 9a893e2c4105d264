// SPDX-License-Identifier: MIT OR Apache-2.0
//! Module for error handling code.

use std::fmt::{Display, Formatter};
use std::error::Error as StdError;

use thiserror::Error;

/// More convenient alias for `Box<dyn StdError + Send + Sync>`,
/// which shows up in a few signatures and structs.
type BoxedError = Box<dyn StdError + Send + Sync>;

/// Kinds of errors for [Error]. Use [ErrorKind::error] and [ErrorKind::error_from] to generate the
/// [Error] value for this ErrorKind.
#[derive(Debug)]
pub enum ErrorKind
{
    /// Serial echo mismatch, OCD framing violation, unexpected prompt.
    Protocol(String),

    /// A device-side command returned a non-zero exit code.
    Command
    {
        code: i32
    },

    /// A subprocess matched its configured error regex, or exited non-zero when checked.
    Subprocess(String),

    /// A long-running server (OpenOCD) failed to reach its ready state.
    Server(String),

    /// Use of a context instance after it self-closed (e.g. after `partition_mmc`, `boot`, `bootm`).
    ContextExited,

    /// A recipe deadline or `force_prompt` deadline was exceeded.
    Timeout(String),

    /// The on-device electronics self-test (BBP) ended in `Failed` or `Cancelled`.
    ProgramFailed(String),

    /// Hostname/version regex mismatch, or no bundle for this device type.
    Validation(String),

    /// Unhandled external error.
    External(ErrorSource),
}

impl ErrorKind
{
    /// Creates a new [Error] from this error kind.
    ///
    /// Enables convenient code like:
    /// ```
    /// return Err(ErrorKind::ContextExited.error());
    /// ```
    #[inline(always)]
    pub fn error(self) -> Error
    {
        Error::new(self, None)
    }

    /// Creates a new [Error] from this error kind, with the passed error as the source.
    #[inline(always)]
    pub fn error_from<E: StdError + Send + Sync + 'static>(self, source: E) -> Error
    {
        Error::new(self, Some(Box::new(source)))
    }
}

impl From<ErrorKind> for Error
{
    fn from(other: ErrorKind) -> Self
    {
        other.error()
    }
}

impl Display for ErrorKind
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
    {
        use ErrorKind::*;
        match self {
            Protocol(why) => write!(f, "protocol error: {}", why)?,
            Command { code } => write!(f, "device command exited with status {}", code)?,
            Subprocess(why) => write!(f, "subprocess error: {}", why)?,
            Server(why) => write!(f, "server failed to become ready: {}", why)?,
            ContextExited => write!(f, "execution context was already exited")?,
            Timeout(why) => write!(f, "timed out: {}", why)?,
            ProgramFailed(state) => write!(f, "on-device program ended in state {}", state)?,
            Validation(why) => write!(f, "validation error: {}", why)?,
            External(source) => {
                use ErrorSource::*;
                match source {
                    StdIo(e) => write!(f, "unhandled std::io::Error: {}", e)?,
                    Json(e) => write!(f, "unhandled serde_json::Error: {}", e)?,
                    Regex(e) => write!(f, "unhandled regex::Error: {}", e)?,
                    Join(e) => write!(f, "unhandled tokio::task::JoinError: {}", e)?,
                };
            },
        };

        Ok(())
    }
}

#[derive(Debug)]
/// Error type for execution-context engine operations. Easily constructed from [ErrorKind].
pub struct Error
{
    pub kind: ErrorKind,
    pub source: Option<BoxedError>,

    /// A string for additional context about what was being attempted when this error occurred.
    ///
    /// Example: "writing firmware image to flash".
    pub context: Option<String>,
}

impl Error
{
    #[inline(always)]
    pub fn new(kind: ErrorKind, source: Option<BoxedError>) -> Self
    {
        Self { kind, source, context: None }
    }

    #[allow(dead_code)]
    /// Add additional context about what was being attempted when this error occurred.
    pub fn with_ctx(mut self, ctx: &str) -> Self
    {
        self.context = Some(ctx.to_string());
        self
    }
}

impl Display for Error
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result
    {
        if let Some(ctx) = &self.context {
            write!(f, "(while {}): {}", ctx, self.kind)?;
        } else {
            write!(f, "{}", self.kind)?;
        }

        if let Some(source) = &self.source {
            writeln!(f, "\nCaused by: {}", source)?;
        }

        Ok(())
    }
}

impl StdError for Error
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)>
    {
        self.source.as_deref().map(|e| e as &dyn StdError)
    }
}

impl From<std::io::Error> for Error
{
    fn from(other: std::io::Error) -> Self
    {
        ErrorKind::External(ErrorSource::StdIo(other)).error()
    }
}

impl From<serde_json::Error> for Error
{
    fn from(other: serde_json::Error) -> Self
    {
        ErrorKind::External(ErrorSource::Json(other)).error()
    }
}

impl From<regex::Error> for Error
{
    fn from(other: regex::Error) -> Self
    {
        ErrorKind::External(ErrorSource::Regex(other)).error()
    }
}

impl From<tokio::task::JoinError> for Error
{
    fn from(other: tokio::task::JoinError) -> Self
    {
        ErrorKind::External(ErrorSource::Join(other)).error()
    }
}

/// Required by `russh::client::Handler::Error: From<russh::Error>`: russh surfaces transport-level failures (disconnects, key exchange errors)
/// through its own error type at points our `Handler` impl has to propagate verbatim.
impl From<russh::Error> for Error
{
    fn from(other: russh::Error) -> Self
    {
        ErrorKind::Protocol(format!("ssh transport error: {}", other)).error_from(other)
    }
}

/// Sources of external error in this library.
#[derive(Debug, Error)]
pub enum ErrorSource
{
    #[error(transparent)]
    StdIo(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Extension trait to enable getting the error kind from a Result<T, Error> with one method.
pub trait ResErrorKind<T>
{
    type Kind;
    fn err_kind(&self) -> Result<&T, &Self::Kind>;
}

impl<T> ResErrorKind<T> for Result<T, Error>
{
    type Kind = ErrorKind;

    fn err_kind(&self) -> Result<&T, &Self::Kind>
    {
        self.as_ref().map_err(|e| &e.kind)
    }
}

/// Whether a failure should be retried by the progress/retry orchestrator. Per
/// the recipe layer's stated policy, every kind named in the error taxonomy (and
/// any generic exception) is retryable, `ContextExited` included: a fresh attempt
/// simply re-enters the context from scratch rather than reusing the exited
/// instance. Only cancellation is exempt, and it never reaches here — it bypasses
/// the retry loop entirely rather than arriving as an `Err`.
pub fn is_retryable(_kind: &ErrorKind) -> bool
{
    true
}

#[macro_export]
macro_rules! log_and_return
{
    ($err:expr) => {
        let err = $err;
        log::error!("{}", err);
        return Err(err);
    }
}
