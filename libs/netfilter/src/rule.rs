//! Rule definitions.

use std::fmt;
use std::net::SocketAddr;

/// Packet-filter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Nat,
    Filter,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule in the managed chain of a table.
///
/// Holds match and target arguments only; the chain is supplied by the
/// [`ChainManager`](crate::ChainManager) that installs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    table: Table,
    spec: Vec<String>,
}

impl Rule {
    /// Create a rule from raw match/target arguments.
    pub fn new(table: Table, spec: Vec<String>) -> Self {
        Self { table, spec }
    }

    /// Redirect TCP traffic for `vip` to `target`.
    pub fn dnat(vip: SocketAddr, target: SocketAddr) -> Self {
        let mut spec = match_tcp(vip);
        spec.extend([
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            target.to_string(),
        ]);
        Self::new(Table::Nat, spec)
    }

    /// Answer TCP connections for `vip` with a reset.
    pub fn reject(vip: SocketAddr) -> Self {
        let mut spec = match_tcp(vip);
        spec.extend([
            "-j".to_string(),
            "REJECT".to_string(),
            "--reject-with".to_string(),
            "tcp-reset".to_string(),
        ]);
        Self::new(Table::Filter, spec)
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn spec(&self) -> &[String] {
        &self.spec
    }

    /// Full argument list for `op` (`-A`, `-D`, ...) on `chain`.
    pub(crate) fn command(&self, op: &str, chain: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            op.to_string(),
            chain.to_string(),
        ];
        args.extend(self.spec.iter().cloned());
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.table, self.spec.join(" "))
    }
}

fn match_tcp(vip: SocketAddr) -> Vec<String> {
    vec![
        "-p".to_string(),
        "tcp".to_string(),
        "-d".to_string(),
        vip.ip().to_string(),
        "--dport".to_string(),
        vip.port().to_string(),
    ]
}
