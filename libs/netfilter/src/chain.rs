//! Managed chain lifecycle.
//!
//! Every table the balancer touches gets one dedicated chain, reached by a
//! jump rule from each hook chain. Service rules live only inside it, so a
//! teardown (unhook, flush, delete) removes everything the balancer ever
//! installed, including leftovers from an unclean shutdown.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{sanitize_output, NetfilterError};
use crate::invoke::{InvokeError, Invoker};
use crate::rule::{Rule, Table};

/// Hook chains that jump to the managed NAT chain.
pub const NAT_HOOKS: &[&str] = &["PREROUTING", "OUTPUT"];

/// Hook chains that jump to the managed filter chain.
pub const FILTER_HOOKS: &[&str] = &["INPUT", "FORWARD"];

/// Output fragments meaning "the chain or rule is not there".
const MISSING_MARKERS: &[&str] = &[
    "No chain/target/match by that name",
    "does a matching rule exist",
    "Couldn't load target",
    "doesn't exist",
];

/// Installs and removes rules in the managed chains.
pub struct ChainManager {
    invoker: Arc<dyn Invoker>,
    chain: String,
    /// Rules added through this manager and not yet deleted, oldest first.
    installed: Mutex<Vec<Rule>>,
}

impl ChainManager {
    /// Create a manager for `chain`, issuing commands through `invoker`.
    pub fn new(invoker: Arc<dyn Invoker>, chain: impl Into<String>) -> Self {
        Self {
            invoker,
            chain: chain.into(),
            installed: Mutex::new(Vec::new()),
        }
    }

    /// Name of the managed chain.
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Rules currently installed through this manager.
    pub fn installed_rules(&self) -> Vec<Rule> {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recreate the managed chain in `table` and hook it into `hooks`.
    ///
    /// Any previous chain state is torn down first, so calling this twice
    /// leaves the same rules as calling it once.
    pub fn setup_chain(&self, table: Table, hooks: &[&str]) -> Result<(), NetfilterError> {
        self.teardown_chain(table, hooks)?;

        self.run(&self.table_args(table, &["-N", &self.chain]), false)?;
        for hook in hooks {
            self.run(&self.table_args(table, &["-I", hook, "-j", &self.chain]), false)?;
        }

        info!(
            table = %table,
            chain = %self.chain,
            hooks = ?hooks,
            "Packet-filter chain installed"
        );
        Ok(())
    }

    /// Delete this manager's rules in `table`, then unhook, flush and
    /// delete the managed chain.
    ///
    /// Tracked rules are deleted newest first. The flush only catches rules
    /// left behind by an earlier process. A chain, jump or rule that does
    /// not exist is not an error.
    pub fn teardown_chain(&self, table: Table, hooks: &[&str]) -> Result<(), NetfilterError> {
        let ours = self.installed_rules();
        for rule in ours.iter().rev().filter(|r| r.table() == table) {
            self.run_ignoring_missing(&rule.command("-D", &self.chain))?;
            self.forget(rule);
        }

        for hook in hooks {
            self.run_ignoring_missing(&self.table_args(table, &["-D", hook, "-j", &self.chain]))?;
        }
        self.run_ignoring_missing(&self.table_args(table, &["-F", &self.chain]))?;
        self.run_ignoring_missing(&self.table_args(table, &["-X", &self.chain]))?;

        debug!(table = %table, chain = %self.chain, "Packet-filter chain removed");
        Ok(())
    }

    /// Append `rule` to the managed chain.
    pub fn add_rule(&self, rule: &Rule) -> Result<(), NetfilterError> {
        self.run(&rule.command("-A", &self.chain), false)?;
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule.clone());
        debug!(chain = %self.chain, rule = %rule, "Rule added");
        Ok(())
    }

    /// Remove `rule` from the managed chain.
    ///
    /// Returns [`NetfilterError::RuleNotFound`] when the rule is not there.
    pub fn delete_rule(&self, rule: &Rule) -> Result<(), NetfilterError> {
        let result = self.run(&rule.command("-D", &self.chain), true);
        // Whatever the kernel said, the rule is no longer ours to reverse.
        self.forget(rule);

        result?;
        debug!(chain = %self.chain, rule = %rule, "Rule deleted");
        Ok(())
    }

    fn forget(&self, rule: &Rule) {
        let mut installed = self
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = installed.iter().rposition(|r| r == rule) {
            installed.remove(pos);
        }
    }

    fn table_args(&self, table: Table, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-t".to_string(), table.as_str().to_string()];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    fn run_ignoring_missing(&self, args: &[String]) -> Result<(), NetfilterError> {
        match self.run(args, true) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn run(&self, args: &[String], deleting: bool) -> Result<Vec<u8>, NetfilterError> {
        let command = args.join(" ");
        match self.invoker.invoke(args) {
            Ok(output) => Ok(output),
            Err(InvokeError::Exit { code, output }) => {
                let message = sanitize_output(&output);
                if deleting && MISSING_MARKERS.iter().any(|m| message.contains(m)) {
                    return Err(NetfilterError::RuleNotFound(command));
                }
                warn!(
                    command = %command,
                    code = ?code,
                    message = %message,
                    "Packet-filter command failed"
                );
                Err(NetfilterError::Command { command, message })
            }
            Err(InvokeError::Spawn(source)) => Err(NetfilterError::Exec { command, source }),
        }
    }
}
