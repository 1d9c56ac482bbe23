// Collaborator interfaces for the packet-filter engine and their production backends

pub mod iptables;
pub mod xt_quota;

use std::fmt;

pub use iptables::IptablesSink;
pub use xt_quota::XtQuotaControl;

/// Address family a rule script is applied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Every family, in submission order (IPv4 always first)
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "ipv4"),
            IpFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Packet-filter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Raw,
    Mangle,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Raw => "raw",
            Table::Mangle => "mangle",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by the rule engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SinkError {
    pub message: String,
    /// Exit status of the engine process, when it ran at all
    pub status: Option<i32>,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: Option<i32>) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }
}

/// Rule engine capability
///
/// Production uses [`IptablesSink`]; tests inject a recording fake.
pub trait RuleSink: Send + Sync {
    /// Apply a restore-style script (one or more `*table ... COMMIT` blocks)
    fn submit(&self, family: IpFamily, script: &str) -> Result<(), SinkError>;

    /// Run a single directive, e.g. `-I bw_INPUT 1 -i wlan0 --jump bw_costly_wlan0`
    fn run(&self, family: IpFamily, table: Table, directive: &str) -> Result<(), SinkError>;

    /// Run a listing directive (`-S`, `-nvx -L <chain>`) and return the dump
    fn list(&self, family: IpFamily, table: Table, query: &str) -> Result<String, SinkError>;
}

/// Live threshold handle of an installed quota2 rule
pub trait QuotaControl: Send + Sync {
    /// Overwrite the remaining quota of the rule named `name`
    fn update(&self, name: &str, bytes: u64) -> std::io::Result<()>;
}
