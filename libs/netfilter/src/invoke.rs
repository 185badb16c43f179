//! Command execution seam.

use std::io;
use std::path::PathBuf;
use std::process::Command;

use thiserror::Error;
use tracing::trace;

/// Failure to run a packet-filter command.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The command ran and exited non-zero.
    #[error("exited with status {code:?}")]
    Exit { code: Option<i32>, output: Vec<u8> },

    /// The command could not be started.
    #[error("failed to execute: {0}")]
    Spawn(#[from] io::Error),
}

/// Runs packet-filter commands.
///
/// `args` never include the binary name.
pub trait Invoker: Send + Sync + 'static {
    fn invoke(&self, args: &[String]) -> Result<Vec<u8>, InvokeError>;
}

impl<F> Invoker for F
where
    F: Fn(&[String]) -> Result<Vec<u8>, InvokeError> + Send + Sync + 'static,
{
    fn invoke(&self, args: &[String]) -> Result<Vec<u8>, InvokeError> {
        self(args)
    }
}

/// Invoker backed by the `iptables` binary.
#[derive(Debug, Clone)]
pub struct IptablesInvoker {
    binary: PathBuf,
}

impl IptablesInvoker {
    /// Create an invoker for the given binary (name or path).
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for IptablesInvoker {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl Invoker for IptablesInvoker {
    fn invoke(&self, args: &[String]) -> Result<Vec<u8>, InvokeError> {
        trace!(binary = %self.binary.display(), args = ?args, "Running packet-filter command");

        // -w waits for the xtables lock instead of failing when another
        // process holds it.
        let output = Command::new(&self.binary).arg("-w").args(args).output()?;

        let mut combined = output.stderr;
        combined.extend_from_slice(&output.stdout);

        if !output.status.success() {
            return Err(InvokeError::Exit {
                code: output.status.code(),
                output: combined,
            });
        }

        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_invoker() {
        let invoker = |args: &[String]| -> Result<Vec<u8>, InvokeError> {
            Ok(args.join(" ").into_bytes())
        };
        let out = invoker
            .invoke(&["-t".to_string(), "nat".to_string()])
            .unwrap();
        assert_eq!(out, b"-t nat");
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let invoker = IptablesInvoker::new("/nonexistent/ferry-iptables");
        let err = invoker.invoke(&["-L".to_string()]).unwrap_err();
        assert!(matches!(err, InvokeError::Spawn(_)));
    }
}
