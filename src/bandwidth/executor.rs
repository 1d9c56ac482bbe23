// Transaction Executor: submits built rules to the engine per address family

use std::sync::Arc;

use super::rules::{Directive, OnFailure, Script};
use crate::backends::{IpFamily, RuleSink, Table};
use crate::error::{BandwidthError, Result};

/// Thin adapter over a [`RuleSink`]
///
/// Every submission runs family-by-family (IPv4 first). The first failure
/// aborts the rest of the operation; the only failure absorbed here is the
/// expected one in [`Executor::prep_costly_chain`] and directives marked
/// [`OnFailure::Tolerate`].
#[derive(Clone)]
pub struct Executor {
    sink: Arc<dyn RuleSink>,
}

impl Executor {
    pub fn new(sink: Arc<dyn RuleSink>) -> Self {
        Self { sink }
    }

    /// Submit scripts in order, each to every family
    pub fn commit(&self, scripts: &[Script]) -> Result<()> {
        for script in scripts {
            let rendered = script.render();
            for family in IpFamily::ALL {
                log::debug!("Submitting {} batch:\n{}", family, rendered);
                if let Err(e) = self.sink.submit(family, &rendered) {
                    log::error!("{} batch rejected: {}", family, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Run directives one at a time, each to every family
    pub fn apply(&self, directives: &[Directive]) -> Result<()> {
        for directive in directives {
            for family in IpFamily::ALL {
                log::debug!("Running {} -t filter {}", family, directive.rule);
                match self.sink.run(family, Table::Filter, &directive.rule) {
                    Ok(()) => {}
                    Err(e) if directive.on_failure == OnFailure::Tolerate => {
                        log::debug!("Ignoring failure of '{}' ({}): {}", directive.rule, family, e);
                    }
                    Err(e) => {
                        log::error!("'{}' failed ({}): {}", directive.rule, family, e);
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Flush-then-declare a costly chain that may or may not exist
    ///
    /// Exactly one of the two directives must fail in every family; zero or
    /// two failures mean the chain is in a state we cannot reason about.
    pub fn prep_costly_chain(&self, chain: &str) -> Result<()> {
        let prep = super::rules::costly_prep(chain);
        let mut failures = IpFamily::ALL.map(|f| (f, 0usize));

        for rule in &prep {
            for (family, count) in failures.iter_mut() {
                log::debug!("Running {} -t filter {}", family, rule);
                if let Err(e) = self.sink.run(*family, Table::Filter, rule) {
                    log::debug!("'{}' failed ({}): {}", rule, family, e);
                    *count += 1;
                }
            }
        }

        for (family, count) in failures {
            if count != 1 {
                log::error!(
                    "Costly chain {} prep saw {} failures for {}, expected exactly 1",
                    chain,
                    count,
                    family
                );
                return Err(BandwidthError::TopologyInconsistency {
                    chain: chain.to_string(),
                    family,
                    failures: count,
                });
            }
        }
        Ok(())
    }

    /// Run a listing query against one family
    pub fn list(&self, family: IpFamily, table: Table, query: &str) -> Result<String> {
        log::debug!("Listing {} -t {} {}", family, table, query);
        self.sink.list(family, table, query).map_err(|e| {
            log::error!("Listing '{}' failed ({}): {}", query, family, e);
            BandwidthError::from(e)
        })
    }
}
