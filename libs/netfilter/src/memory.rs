//! In-memory packet filter for tests.
//!
//! Emulates the subset of `iptables` the chain manager uses (`-N`, `-X`,
//! `-F`, `-A`, `-I`, `-D` with `-t`) closely enough that error output
//! matches the real tool, and records the rule state after every command.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::invoke::{InvokeError, Invoker};
use crate::rule::Table;

/// Rule state: `(table, chain)` to rule specs in order.
pub type RuleSnapshot = BTreeMap<(Table, String), Vec<String>>;

const BUILTIN_CHAINS: &[(Table, &str)] = &[
    (Table::Nat, "PREROUTING"),
    (Table::Nat, "INPUT"),
    (Table::Nat, "OUTPUT"),
    (Table::Nat, "POSTROUTING"),
    (Table::Filter, "INPUT"),
    (Table::Filter, "FORWARD"),
    (Table::Filter, "OUTPUT"),
];

const BUILTIN_TARGETS: &[&str] = &[
    "ACCEPT",
    "DROP",
    "RETURN",
    "REJECT",
    "DNAT",
    "SNAT",
    "MASQUERADE",
];

#[derive(Debug, Default)]
struct State {
    chains: RuleSnapshot,
    history: Vec<(Vec<String>, RuleSnapshot)>,
    fail_when: Option<String>,
}

/// An [`Invoker`] that keeps rules in memory.
#[derive(Debug)]
pub struct MemoryInvoker {
    state: Mutex<State>,
}

impl Default for MemoryInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInvoker {
    /// Create a filter with only the built-in chains.
    pub fn new() -> Self {
        let mut state = State::default();
        for (table, chain) in BUILTIN_CHAINS {
            state.chains.insert((*table, chain.to_string()), Vec::new());
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Fail every command whose arguments contain `fragment`.
    pub fn fail_when(&self, fragment: Option<&str>) {
        self.lock().fail_when = fragment.map(str::to_string);
    }

    /// Rules in a chain, or empty when the chain does not exist.
    pub fn rules(&self, table: Table, chain: &str) -> Vec<String> {
        self.lock()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn chain_exists(&self, table: Table, chain: &str) -> bool {
        self.lock().chains.contains_key(&(table, chain.to_string()))
    }

    /// Current rule state.
    pub fn snapshot(&self) -> RuleSnapshot {
        self.lock().chains.clone()
    }

    /// Every command received with the rule state right after it.
    pub fn history(&self) -> Vec<(Vec<String>, RuleSnapshot)> {
        self.lock().history.clone()
    }

    /// Every command received, joined with spaces.
    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .history
            .iter()
            .map(|(args, _)| args.join(" "))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Invoker for MemoryInvoker {
    fn invoke(&self, args: &[String]) -> Result<Vec<u8>, InvokeError> {
        let mut state = self.lock();
        let result = apply(&mut state, args);
        let snapshot = state.chains.clone();
        state.history.push((args.to_vec(), snapshot));
        result
    }
}

fn apply(state: &mut State, args: &[String]) -> Result<Vec<u8>, InvokeError> {
    if let Some(fragment) = &state.fail_when {
        if args.join(" ").contains(fragment.as_str()) {
            return exit(1, "iptables: injected failure.");
        }
    }

    let (table, rest) = match args {
        [flag, table, rest @ ..] if flag == "-t" => match table.as_str() {
            "nat" => (Table::Nat, rest),
            "filter" => (Table::Filter, rest),
            other => {
                return exit(
                    3,
                    &format!(
                        "iptables v1.8.9 (legacy): can't initialize iptables table `{}'",
                        other
                    ),
                )
            }
        },
        rest => (Table::Filter, rest),
    };

    let [op, chain, spec @ ..] = rest else {
        return exit(2, "iptables v1.8.9 (legacy): no command specified");
    };
    let key = (table, chain.clone());
    let spec = spec.join(" ");

    match op.as_str() {
        "-N" => {
            if state.chains.contains_key(&key) {
                return exit(1, "iptables: Chain already exists.");
            }
            state.chains.insert(key, Vec::new());
        }
        "-X" => {
            let Some(rules) = state.chains.get(&key) else {
                return exit(1, "iptables: No chain/target/match by that name.");
            };
            if !rules.is_empty() {
                return exit(1, "iptables: Directory not empty.");
            }
            let jump = format!("-j {}", chain);
            let referenced = state
                .chains
                .iter()
                .any(|((t, _), rules)| *t == table && rules.iter().any(|r| r.ends_with(&jump)));
            if referenced {
                return exit(1, "iptables: Too many links.");
            }
            state.chains.remove(&key);
        }
        "-F" => {
            let Some(rules) = state.chains.get_mut(&key) else {
                return exit(1, "iptables: No chain/target/match by that name.");
            };
            rules.clear();
        }
        "-A" | "-I" => {
            if let Some(target) = jump_target(&spec) {
                let known = BUILTIN_TARGETS.contains(&target)
                    || state.chains.contains_key(&(table, target.to_string()));
                if !known {
                    return exit(
                        2,
                        &format!(
                            "iptables v1.8.9 (legacy): Couldn't load target `{}':No such file or directory",
                            target
                        ),
                    );
                }
            }
            let Some(rules) = state.chains.get_mut(&key) else {
                return exit(1, "iptables: No chain/target/match by that name.");
            };
            if op == "-A" {
                rules.push(spec);
            } else {
                rules.insert(0, spec);
            }
        }
        "-D" => {
            if let Some(target) = jump_target(&spec) {
                let known = BUILTIN_TARGETS.contains(&target)
                    || state.chains.contains_key(&(table, target.to_string()));
                if !known {
                    return exit(
                        2,
                        &format!(
                            "iptables v1.8.9 (legacy): Couldn't load target `{}':No such file or directory",
                            target
                        ),
                    );
                }
            }
            let Some(rules) = state.chains.get_mut(&key) else {
                return exit(1, "iptables: No chain/target/match by that name.");
            };
            let Some(pos) = rules.iter().position(|r| *r == spec) else {
                return exit(1, "iptables: Bad rule (does a matching rule exist in that chain?).");
            };
            rules.remove(pos);
        }
        other => {
            return exit(2, &format!("iptables v1.8.9 (legacy): unknown option \"{}\"", other));
        }
    }

    Ok(Vec::new())
}

fn jump_target(spec: &str) -> Option<&str> {
    let mut words = spec.split_whitespace();
    while let Some(word) = words.next() {
        if word == "-j" {
            return words.next();
        }
    }
    None
}

fn exit(code: i32, message: &str) -> Result<Vec<u8>, InvokeError> {
    Err(InvokeError::Exit {
        code: Some(code),
        output: format!("{}\n", message).into_bytes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_jump_to_unknown_chain_fails() {
        let filter = MemoryInvoker::new();
        let err = filter
            .invoke(&args("-t nat -I PREROUTING -j FERRY"))
            .unwrap_err();
        assert!(matches!(err, InvokeError::Exit { code: Some(2), .. }));
    }

    #[test]
    fn test_delete_referenced_chain_fails() {
        let filter = MemoryInvoker::new();
        filter.invoke(&args("-t nat -N FERRY")).unwrap();
        filter.invoke(&args("-t nat -I PREROUTING -j FERRY")).unwrap();
        assert!(filter.invoke(&args("-t nat -X FERRY")).is_err());

        filter.invoke(&args("-t nat -D PREROUTING -j FERRY")).unwrap();
        filter.invoke(&args("-t nat -X FERRY")).unwrap();
        assert!(!filter.chain_exists(Table::Nat, "FERRY"));
    }

    #[test]
    fn test_history_records_failures_too() {
        let filter = MemoryInvoker::new();
        filter.fail_when(Some("REJECT"));
        assert!(filter
            .invoke(&args("-A INPUT -p tcp -j REJECT"))
            .is_err());
        assert_eq!(filter.commands(), vec!["-A INPUT -p tcp -j REJECT"]);
        assert!(filter.rules(Table::Filter, "INPUT").is_empty());
    }
}
