// Pure builders for rule scripts and single directives

use std::fmt::Write;

use super::chains::*;
use crate::backends::Table;

/// Rule manipulation verb
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Insert,
    Append,
    Delete,
}

impl RuleOp {
    pub fn flag(&self) -> &'static str {
        match self {
            RuleOp::Insert => "-I",
            RuleOp::Append => "-A",
            RuleOp::Delete => "-D",
        }
    }
}

/// Ordered directives for one table, terminated by `COMMIT` when rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBatch {
    pub table: Table,
    pub directives: Vec<String>,
}

impl RuleBatch {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            directives: Vec::new(),
        }
    }

    pub fn push(&mut self, directive: impl Into<String>) -> &mut Self {
        self.directives.push(directive.into());
        self
    }
}

/// One engine submission: a sequence of table batches applied together
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub batches: Vec<RuleBatch>,
}

impl Script {
    pub fn single(batch: RuleBatch) -> Self {
        Self {
            batches: vec![batch],
        }
    }

    /// Render in restore format: `*table`, directives, `COMMIT`, per batch
    pub fn render(&self) -> String {
        let mut out = String::new();
        for batch in &self.batches {
            let _ = writeln!(out, "*{}", batch.table);
            for directive in &batch.directives {
                out.push_str(directive);
                out.push('\n');
            }
            out.push_str("COMMIT\n");
        }
        out
    }
}

/// What the executor does when a single directive fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFailure {
    Abort,
    Tolerate,
}

/// A filter-table directive submitted on its own, with its own failure policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub rule: String,
    pub on_failure: OnFailure,
}

impl Directive {
    pub fn strict(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            on_failure: OnFailure::Abort,
        }
    }

    pub fn tolerant(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            on_failure: OnFailure::Tolerate,
        }
    }
}

/// Which happy/penalty list an app operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppList {
    /// Exempt from data saver and costly penalties
    Nice,
    /// Always rejected on costly interfaces
    Naughty,
}

fn quota_match(bytes: u64, name: &str) -> String {
    format!("-m quota2 ! --quota {} --name {}", bytes, name)
}

/// Listing directive used to discover chains left over from a previous run
pub const LIST_CHAINS: &str = "-S";

/// Listing directive for the tethering counters
pub fn tether_counters_query() -> String {
    format!("-nvx -L {}", TETHER_COUNTERS)
}

/// Flush (and optionally delete) costly chains left by a previous run
pub fn cleanup_script(stale: &[String], delete: bool) -> Option<Script> {
    if stale.is_empty() {
        return None;
    }

    let mut batch = RuleBatch::new(Table::Filter);
    for chain in stale {
        batch.push(format!(":{} -", chain));
        if delete {
            batch.push(format!("-X {}", chain));
        }
    }
    Some(Script::single(batch))
}

/// Declare (and thereby flush) every static chain
pub fn static_topology_script() -> Script {
    let batches = STATIC_CHAINS
        .iter()
        .map(|(table, chains)| {
            let mut batch = RuleBatch::new(*table);
            for chain in chains.iter() {
                batch.push(format!(":{} -", chain));
            }
            batch
        })
        .collect();
    Script { batches }
}

/// Default accounting rules installed into the freshly flushed topology
pub fn accounting_script() -> Script {
    let mut filter = RuleBatch::new(Table::Filter);
    filter
        .push(format!("-A {} -m owner --socket-exists", LOCAL_INPUT))
        .push(format!("-A {} -m owner --socket-exists", LOCAL_OUTPUT))
        .push(format!("-A {} --jump {}", COSTLY_SHARED, PENALTY_BOX))
        .push(format!("-A {} --jump {}", PENALTY_BOX, HAPPY_BOX))
        .push(format!("-A {} --jump {}", HAPPY_BOX, DATA_SAVER))
        .push(format!("-A {} -j RETURN", DATA_SAVER))
        .push(format!(
            "-I {} -m owner --uid-owner 0-{} --jump RETURN",
            HAPPY_BOX,
            FIRST_APPLICATION_UID - 1
        ));

    let mut raw = RuleBatch::new(Table::Raw);
    raw.push(format!("-A {} -m owner --socket-exists", RAW_PREROUTING));

    let mut mangle = RuleBatch::new(Table::Mangle);
    mangle.push(format!("-A {} -m owner --socket-exists", MANGLE_POSTROUTING));

    Script {
        batches: vec![filter, raw, mangle],
    }
}

/// Flip the first data saver rule between REJECT and RETURN
pub fn data_saver_script(enable: bool) -> Script {
    let target = if enable { "REJECT" } else { "RETURN" };
    let mut batch = RuleBatch::new(Table::Filter);
    batch.push(format!("-R {} 1 --jump {}", DATA_SAVER, target));
    Script::single(batch)
}

/// Named alert on the local input and output chains
pub fn alert_script(op: RuleOp, name: &str, bytes: u64) -> Script {
    let mut batch = RuleBatch::new(Table::Filter);
    for chain in [LOCAL_INPUT, LOCAL_OUTPUT] {
        batch.push(format!("{} {} {}", op.flag(), chain, quota_match(bytes, name)));
    }
    Script::single(batch)
}

/// Named alert on the forward chain
pub fn alert_fwd_script(op: RuleOp, name: &str, bytes: u64) -> Script {
    let mut batch = RuleBatch::new(Table::Filter);
    batch.push(format!(
        "{} {} {}",
        op.flag(),
        LOCAL_FORWARD,
        quota_match(bytes, name)
    ));
    Script::single(batch)
}

/// Alert attached to the end of a costly chain (shared or per-interface)
pub fn costly_alert_script(op: RuleOp, chain: &str, name: &str, bytes: u64) -> Script {
    let mut batch = RuleBatch::new(Table::Filter);
    batch.push(format!("{} {} {}", op.flag(), chain, quota_match(bytes, name)));
    Script::single(batch)
}

/// One owner-match directive per UID against the happy or penalty box
pub fn app_script(list: AppList, op: RuleOp, uids: &[u32]) -> Script {
    let (chain, target) = match list {
        AppList::Nice => (HAPPY_BOX, "RETURN"),
        AppList::Naughty => (PENALTY_BOX, "REJECT"),
    };

    let mut batch = RuleBatch::new(Table::Filter);
    for uid in uids {
        batch.push(format!(
            "{} {} -m owner --uid-owner {} --jump {}",
            op.flag(),
            chain,
            uid,
            target
        ));
    }
    Script::single(batch)
}

/// Flush-then-declare pair for a costly chain
///
/// Exactly one of the two is expected to fail per family: the flush when
/// the chain is new, the declare when it already exists.
pub fn costly_prep(chain: &str) -> [String; 2] {
    [format!("-F {}", chain), format!("-N {}", chain)]
}

/// Hook rules steering an interface into a costly chain
///
/// Input/output hooks are replaced at position 1 so the newest interface
/// wins; deletes are tolerated since the hook may not exist yet.
pub fn costly_hook_directives(iface: &str, chain: &str) -> Vec<Directive> {
    vec![
        Directive::tolerant(format!("-D {} -i {} --jump {}", LOCAL_INPUT, iface, chain)),
        Directive::strict(format!("-I {} 1 -i {} --jump {}", LOCAL_INPUT, iface, chain)),
        Directive::tolerant(format!("-D {} -o {} --jump {}", LOCAL_OUTPUT, iface, chain)),
        Directive::strict(format!("-I {} 1 -o {} --jump {}", LOCAL_OUTPUT, iface, chain)),
        Directive::tolerant(format!("-D {} -o {} --jump {}", LOCAL_FORWARD, iface, chain)),
        Directive::strict(format!("-A {} -o {} --jump {}", LOCAL_FORWARD, iface, chain)),
    ]
}

/// Removal of the hook rules installed by [`costly_hook_directives`]
pub fn remove_costly_hook_directives(iface: &str, chain: &str) -> Vec<Directive> {
    vec![
        Directive::strict(format!("-D {} -i {} --jump {}", LOCAL_INPUT, iface, chain)),
        Directive::strict(format!("-D {} -o {} --jump {}", LOCAL_OUTPUT, iface, chain)),
        Directive::strict(format!("-D {} -o {} --jump {}", LOCAL_FORWARD, iface, chain)),
    ]
}

/// Rules installed after the costly chain for `iface` has been prepared
pub fn interface_quota_directives(iface: &str, bytes: u64) -> Vec<Directive> {
    let chain = costly_chain(iface);
    let mut directives = vec![Directive::strict(format!(
        "-A {} -j {}",
        chain, PENALTY_BOX
    ))];
    directives.extend(costly_hook_directives(iface, &chain));
    directives.push(Directive::strict(format!(
        "-A {} {} --jump REJECT",
        chain,
        quota_match(bytes, iface)
    )));
    directives
}

/// Full teardown of an interface's hooks and dedicated chain
pub fn remove_interface_quota_directives(iface: &str) -> Vec<Directive> {
    let chain = costly_chain(iface);
    let mut directives = remove_costly_hook_directives(iface, &chain);
    directives.push(Directive::strict(format!("-F {}", chain)));
    directives.push(Directive::strict(format!("-X {}", chain)));
    directives
}

/// The single quota-reject rule serving the whole shared group
pub fn shared_quota_directive(op: RuleOp, bytes: u64) -> Directive {
    Directive::strict(format!(
        "{} {} {} --jump REJECT",
        op.flag(),
        COSTLY_SHARED,
        quota_match(bytes, SHARED_QUOTA_NAME)
    ))
}
