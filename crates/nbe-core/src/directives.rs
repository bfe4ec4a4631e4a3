//! Cell directive parsing
//!
//! Leading lines of a cell's input of the form `%name` (or the legacy
//! `#auto`) are directives. Everything after the first non-directive line is
//! the body handed to the backend. Blank lines inside the directive prefix are
//! skipped.
//!
//! ```text
//! %auto
//! %python
//! print(1 + 1)      <- body
//! ```

use serde::{Deserialize, Serialize};

/// A single parsed directive
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Directive {
    /// Run whenever a fresh backend session starts
    Auto,
    /// Hide the input in the presentation layer
    Hide,
    /// Hide input and output
    HideAll,
    /// Ask the backend to time the evaluation
    Time,
    /// Ask the backend for repeated timing
    TimeIt,
    /// Persist the worksheet before executing
    SaveServer,
    /// Evaluate in another system (`%python`, `%gap`, ...)
    System(String),
}

impl Directive {
    fn from_name(name: &str) -> Self {
        match name {
            "auto" => Self::Auto,
            "hide" => Self::Hide,
            "hideall" => Self::HideAll,
            "time" => Self::Time,
            "timeit" => Self::TimeIt,
            "save_server" => Self::SaveServer,
            other => Self::System(other.to_string()),
        }
    }
}

/// Malformed directive line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DirectiveError {
    /// `%` with no name
    #[error("line {line}: empty directive")]
    Empty { line: usize },

    /// Name with characters outside `[A-Za-z0-9_.-]`
    #[error("line {line}: malformed directive '%{text}'")]
    Malformed { line: usize, text: String },
}

/// Commands typed as a cell body that act on the session instead of running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// `restart`, `quit` or `exit`
    Restart,
}

/// Result of parsing a cell's input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedInput {
    directives: Vec<Directive>,
    body: String,
}

impl ParsedInput {
    /// Directives in source order
    #[inline]
    #[must_use]
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Input with directive lines removed, trimmed
    #[inline]
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// System override; the last system directive wins
    #[must_use]
    pub fn system(&self) -> Option<&str> {
        self.directives.iter().rev().find_map(|d| match d {
            Directive::System(s) => Some(s.as_str()),
            _ => None,
        })
    }

    /// Check for a directive
    #[inline]
    #[must_use]
    pub fn has(&self, directive: &Directive) -> bool {
        self.directives.contains(directive)
    }

    /// Whether the backend should report timing
    #[inline]
    #[must_use]
    pub fn wants_timing(&self) -> bool {
        self.has(&Directive::Time) || self.has(&Directive::TimeIt)
    }

    /// Body recognised as a session command
    #[must_use]
    pub fn session_command(&self) -> Option<SessionCommand> {
        match self.body.as_str() {
            "restart" | "quit" | "exit" => Some(SessionCommand::Restart),
            _ => None,
        }
    }
}

/// Parse the directive prefix of a cell's input
///
/// # Errors
/// `DirectiveError` for an empty or malformed `%` line in the prefix.
pub fn parse(input: &str) -> Result<ParsedInput, DirectiveError> {
    let mut directives = Vec::new();
    let mut rest = input;
    let mut line_no = 0usize;

    loop {
        let (line, remainder) = match rest.split_once('\n') {
            Some((line, remainder)) => (line, Some(remainder)),
            None => (rest, None),
        };
        line_no += 1;
        let trimmed = line.trim();

        let name = if trimmed.is_empty() {
            None
        } else if trimmed == "#auto" {
            Some("auto")
        } else if let Some(name) = trimmed.strip_prefix('%') {
            Some(name.trim())
        } else {
            break;
        };

        if let Some(name) = name {
            if name.is_empty() {
                return Err(DirectiveError::Empty { line: line_no });
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return Err(DirectiveError::Malformed {
                    line: line_no,
                    text: name.to_string(),
                });
            }
            directives.push(Directive::from_name(name));
        }

        match remainder {
            Some(remainder) => rest = remainder,
            None => {
                rest = "";
                break;
            }
        }
    }

    Ok(ParsedInput {
        directives,
        body: rest.trim().to_string(),
    })
}
