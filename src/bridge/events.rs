//! Line protocol spoken with the hosted companion script.
//!
//! Commands are framed as `<VERB> <code>` followed by a lone `END` line.
//! Replies are single lines: `RES <json>` on stdout for a successful call,
//! any other stdout line is log output, and any stderr line is the error
//! text of the pending call.

use super::error::{BridgeError, StreamReadError};

/// Line terminating every command envelope.
pub const END_MARKER: &str = "END";

/// Prefix marking a result line on stdout.
pub const RESULT_PREFIX: &str = "RES";

/// Code evaluated to ask the hosted process to exit.
pub const EXIT_CODE: &str = "phantom.exit()";

/// A command sent on the interpreter's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Evaluate code in the global context; no reply expected.
    Eval(&'a str),
    /// Invoke a function and wait for exactly one reply.
    Run(&'a str),
}

impl<'a> Command<'a> {
    /// The cooperative shutdown request.
    #[must_use]
    pub fn exit() -> Self {
        Self::Eval(EXIT_CODE)
    }

    /// Protocol verb for this command.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Eval(_) => "EVAL",
            Self::Run(_) => "RUN",
        }
    }

    /// Code carried by this command.
    #[must_use]
    pub fn code(&self) -> &'a str {
        match self {
            Self::Eval(code) | Self::Run(code) => code,
        }
    }

    /// Frame the command as it is written to stdin.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::InvalidCommand` if a line of the code is the
    /// bare end marker, which would cut the envelope short.
    pub fn encode(&self) -> Result<String, BridgeError> {
        let code = self.code().trim_end_matches(['\r', '\n']);
        if code.lines().any(|line| line.trim_end_matches('\r') == END_MARKER) {
            return Err(BridgeError::InvalidCommand(format!(
                "code contains a bare `{END_MARKER}` line"
            )));
        }
        Ok(format!("{} {code}\n{END_MARKER}\n", self.verb()))
    }
}

/// A non-empty output line after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedLine {
    /// `RES <payload>` on stdout.
    Result(String),
    /// Any other stdout line.
    Log(String),
    /// Any stderr line.
    Error(String),
}

/// An item delivered to the correlator queue of one stream.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Payload of a result line.
    Result(String),
    /// Error text of an stderr line.
    Error(String),
    /// The stream stopped for good.
    Closed(StreamReadError),
}

/// Split a `RES` line into its payload.
///
/// Accepts `RES <payload>` and the tagged form `RES<digits> <payload>`
/// written by wrappers that number their calls.
#[must_use]
pub fn strip_result_prefix(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(RESULT_PREFIX)?;
    let tag_len = rest.bytes().take_while(u8::is_ascii_digit).count();
    rest[tag_len..].strip_prefix(' ')
}

/// Classify one stdout line. Returns `None` for blank lines.
#[must_use]
pub fn classify_stdout(line: &str) -> Option<ClassifiedLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    Some(match strip_result_prefix(line) {
        Some(payload) => ClassifiedLine::Result(payload.to_string()),
        None => ClassifiedLine::Log(line.to_string()),
    })
}

/// Classify one stderr line. Returns `None` for blank lines.
///
/// A thrown value is usually written JSON-encoded, possibly behind a result
/// tag; both are peeled off so the caller sees the bare message.
#[must_use]
pub fn classify_stderr(line: &str) -> Option<ClassifiedLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let text = strip_result_prefix(line).unwrap_or(line).trim();
    let message = match serde_json::from_str::<String>(text) {
        Ok(unquoted) => unquoted,
        Err(_) => text.to_string(),
    };
    Some(ClassifiedLine::Error(message))
}
