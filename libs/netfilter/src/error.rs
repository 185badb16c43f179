//! Netfilter error types and output sanitising.

use std::io;

use thiserror::Error;

/// Longest command output carried in an error message.
pub const MAX_MESSAGE_LEN: usize = 200;

/// Errors from chain and rule operations.
#[derive(Debug, Error)]
pub enum NetfilterError {
    /// The command ran and failed.
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    /// The command could not be run at all.
    #[error("could not run `{command}`: {source}")]
    Exec {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The rule to delete is not installed.
    #[error("rule not found: {0}")]
    RuleNotFound(String),
}

impl NetfilterError {
    /// True for "already gone" failures during cleanup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetfilterError::RuleNotFound(_))
    }
}

/// Make command output safe to log.
///
/// Control characters become spaces, whitespace runs collapse, and the
/// result is capped at [`MAX_MESSAGE_LEN`] characters.
pub fn sanitize_output(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_MESSAGE_LEN {
        return collapsed;
    }

    let mut truncated: String = collapsed.chars().take(MAX_MESSAGE_LEN).collect();
    truncated.push_str("...");
    truncated
}
