//! Exception taxonomy and formatting for the MAL abstract machine.
//!
//! Callbacks signal failure by returning an owned exception value; the
//! interpreter alone decides where it is caught. The wire shape of an
//! exception is a formatted string `<Kind>:<function[pc]>:<message>`, and
//! cascaded exceptions stack such lines newline-separated, oldest first.

use std::fmt;
use std::io::Write;

use once_cell::sync::Lazy;
use thiserror::Error;

/// Variable name that catches exceptions of any kind.
pub const ANY_EXCEPTION: &str = "ANYexception";

/// Statically allocated text used when allocation itself failed, so that
/// reporting the failure cannot recurse into the allocator.
pub const MEMORY_ALLOCATION_FAILED: &str = "Memory allocation failed.";

/// Prefix used when wrapping errors captured from the kernel error buffer.
pub const KERNEL_ERROR_PREFIX: &str = "GDKerror";

/// The closed set of exception kinds.
///
/// Each kind doubles as the string prefix of a formatted exception and as
/// the name of the block variable that catches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum ExceptionKind {
    #[error("MAL")]
    Mal,
    #[error("IllegalArgument")]
    IllegalArgument,
    #[error("OutOfBounds")]
    OutOfBounds,
    #[error("IO")]
    Io,
    #[error("InvalidCredentials")]
    InvalidCredentials,
    #[error("Optimizer")]
    Optimizer,
    #[error("StackOverflow")]
    StackOverflow,
    #[error("Syntax")]
    Syntax,
    #[error("Type")]
    Type,
    #[error("Loader")]
    Loader,
    #[error("Parse")]
    Parse,
    #[error("Arithmetic")]
    Arithmetic,
    #[error("PermissionDenied")]
    PermissionDenied,
    #[error("SQL")]
    Sql,
}

/// All kinds, in reporting order.
pub const EXCEPTION_KINDS: [ExceptionKind; 14] = [
    ExceptionKind::Mal,
    ExceptionKind::IllegalArgument,
    ExceptionKind::OutOfBounds,
    ExceptionKind::Io,
    ExceptionKind::InvalidCredentials,
    ExceptionKind::Optimizer,
    ExceptionKind::StackOverflow,
    ExceptionKind::Syntax,
    ExceptionKind::Type,
    ExceptionKind::Loader,
    ExceptionKind::Parse,
    ExceptionKind::Arithmetic,
    ExceptionKind::PermissionDenied,
    ExceptionKind::Sql,
];

impl ExceptionKind {
    /// The canonical name: string prefix and catch-variable name at once.
    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::Mal => "MAL",
            ExceptionKind::IllegalArgument => "IllegalArgument",
            ExceptionKind::OutOfBounds => "OutOfBounds",
            ExceptionKind::Io => "IO",
            ExceptionKind::InvalidCredentials => "InvalidCredentials",
            ExceptionKind::Optimizer => "Optimizer",
            ExceptionKind::StackOverflow => "StackOverflow",
            ExceptionKind::Syntax => "Syntax",
            ExceptionKind::Type => "Type",
            ExceptionKind::Loader => "Loader",
            ExceptionKind::Parse => "Parse",
            ExceptionKind::Arithmetic => "Arithmetic",
            ExceptionKind::PermissionDenied => "PermissionDenied",
            ExceptionKind::Sql => "SQL",
        }
    }

    /// Resolves a prefix token to a kind. Accepts the short form `Arith`
    /// seen in kernel-produced messages.
    pub fn parse(token: &str) -> Option<Self> {
        if token == "Arith" {
            return Some(ExceptionKind::Arithmetic);
        }
        EXCEPTION_KINDS.iter().copied().find(|k| k.name() == token)
    }
}

/// Returns true when `name` is one of the catchable exception names,
/// including the wildcard.
pub fn is_exception_variable(name: &str) -> bool {
    name == ANY_EXCEPTION || ExceptionKind::parse(name).is_some()
}

/// An owned MAL exception.
///
/// The payload is the formatted string the rest of the system observes; the
/// kind is the parsed prefix of its first line and is kept alongside so
/// classification does not re-parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{text}")]
pub struct MalException {
    kind: ExceptionKind,
    text: String,
}

/// Result type used by every fallible VM operation and callback.
pub type MalResult<T> = std::result::Result<T, MalException>;

impl MalException {
    /// Builds `<Kind>:<fcn>:<message>` for failures with no block context.
    pub fn new(kind: ExceptionKind, fcn: &str, message: impl fmt::Display) -> Self {
        Self {
            kind,
            text: format!("{}:{}:{}", kind.name(), fcn, message),
        }
    }

    /// Builds `<Kind>:<qualname[pc]>:<message>` for failures raised while
    /// executing a block.
    pub fn located(
        kind: ExceptionKind,
        qualname: &str,
        pc: usize,
        message: impl fmt::Display,
    ) -> Self {
        Self {
            kind,
            text: format!("{}:{}[{}]:{}", kind.name(), qualname, pc, message),
        }
    }

    /// Adopts an already-formatted payload, classifying it by its first
    /// prefix token. Unknown prefixes classify as `MAL`, matching the
    /// behaviour front-ends rely on for foreign error text.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = prefix_token(&text)
            .and_then(ExceptionKind::parse)
            .unwrap_or(ExceptionKind::Mal);
        Self { kind, text }
    }

    /// The out-of-memory exception, built once so reporting an allocation
    /// failure does not allocate again.
    pub fn out_of_memory() -> Self {
        static OUT_OF_MEMORY: Lazy<MalException> = Lazy::new(|| MalException {
            kind: ExceptionKind::Mal,
            text: MEMORY_ALLOCATION_FAILED.to_string(),
        });
        OUT_OF_MEMORY.clone()
    }

    /// Stacks a newly formatted layer under `self`, producing the cascaded
    /// trail `self\nKind:qualname[pc]:message`. Classification stays with
    /// the first line, where the trail originated.
    pub fn cascade(
        self,
        kind: ExceptionKind,
        qualname: &str,
        pc: usize,
        message: impl fmt::Display,
    ) -> Self {
        Self {
            kind: self.kind,
            text: format!(
                "{}\n{}:{}[{}]:{}",
                self.text,
                kind.name(),
                qualname,
                pc,
                message
            ),
        }
    }

    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    /// The formatted payload.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consumes the exception, yielding the payload for storage in a catch
    /// variable.
    pub fn into_text(self) -> String {
        self.text
    }

    /// The first prefix token, used for catch-variable routing.
    pub fn prefix(&self) -> &str {
        prefix_token(&self.text).unwrap_or("")
    }

    /// The `function[pc]` segment of the first line, when present.
    pub fn place(&self) -> Option<&str> {
        let first = self.text.lines().next()?;
        let rest = first.split_once(':')?.1;
        Some(rest.split_once(':')?.0)
    }

    /// The message segment of the first line; the whole line when the
    /// payload does not follow the canonical shape.
    pub fn message(&self) -> &str {
        let first = self.text.lines().next().unwrap_or("");
        match first.split_once(':').and_then(|(_, r)| r.split_once(':')) {
            Some((_, msg)) => msg,
            None => first.strip_prefix("!ERROR: ").unwrap_or(first),
        }
    }

    /// Writes the exception to a session stream, one `!`-prefixed line per
    /// cascaded layer. Empty lines are skipped and an existing `!` is not
    /// doubled.
    pub fn dump_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        for line in self.text.lines() {
            let line = line.strip_prefix('!').unwrap_or(line);
            if !line.is_empty() {
                writeln!(out, "!{line}")?;
            }
        }
        Ok(())
    }
}

fn prefix_token(text: &str) -> Option<&str> {
    let first = text.lines().next()?;
    first.split_once(':').map(|(tok, _)| tok)
}
