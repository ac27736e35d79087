//! Error reporting channel between the runtime and its embedder.
//!
//! Compile-time, deserialization and escaped runtime errors are reported
//! synchronously through a callback; runtime exceptions that are handled
//! in-language never reach it.

use std::fmt;

/// What kind of failure is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed source (lexer/parser).
    Syntax,
    /// Well-formed source the compiler rejected.
    Compile,
    /// A runtime exception unwound past the top frame.
    Runtime,
    /// A `.bric` stream was corrupt or truncated.
    Deserialize,
    /// A `.bric` stream had the wrong magic or major version.
    Version,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Syntax => "syntax error",
            ErrorKind::Compile => "compile error",
            ErrorKind::Runtime => "runtime error",
            ErrorKind::Deserialize => "deserialize error",
            ErrorKind::Version => "version error",
        };
        f.write_str(s)
    }
}

/// Invoked once per diagnostic: kind, file path (when known), 1-indexed
/// line (0 when not applicable), message.
pub type ErrorCallback = Box<dyn FnMut(ErrorKind, Option<&str>, u32, &str)>;

/// The default callback writes diagnostics to stderr.
pub fn default_error_callback() -> ErrorCallback {
    Box::new(|kind, path, line, message| match (path, line) {
        (Some(p), l) if l > 0 => eprintln!("{}:{}: {}: {}", p, l, kind, message),
        (Some(p), _) => eprintln!("{}: {}: {}", p, kind, message),
        (None, l) if l > 0 => eprintln!("line {}: {}: {}", l, kind, message),
        (None, _) => eprintln!("{}: {}", kind, message),
    })
}
