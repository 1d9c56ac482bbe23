// Recording fakes for the engine collaborators, used by unit tests

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use crate::backends::{IpFamily, QuotaControl, RuleSink, SinkError, Table};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Submit(IpFamily, String),
    Run(IpFamily, Table, String),
    List(IpFamily, Table, String),
}

/// Stateful fake rule sink
///
/// Records every call. Submissions and directives succeed unless a result
/// was queued (`false` = fail). Listings pop queued outputs and fail once
/// the queue is empty, like an engine that could not be executed.
#[derive(Debug, Default)]
pub struct FakeSink {
    calls: Mutex<Vec<SinkCall>>,
    submit_results: Mutex<VecDeque<bool>>,
    run_results: Mutex<VecDeque<bool>>,
    list_outputs: Mutex<VecDeque<String>>,
}

impl FakeSink {
    pub fn push_submit_results(&self, results: &[bool]) {
        self.submit_results.lock().unwrap().extend(results);
    }

    pub fn push_run_results(&self, results: &[bool]) {
        self.run_results.lock().unwrap().extend(results);
    }

    pub fn push_list_output(&self, output: &str) {
        self.list_outputs.lock().unwrap().push_back(output.to_string());
    }

    pub fn clear_list_outputs(&self) {
        self.list_outputs.lock().unwrap().clear();
    }

    pub fn take_calls(&self) -> Vec<SinkCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    /// The same script submitted to IPv4 then IPv6
    pub fn v4v6_submit(script: &str) -> Vec<SinkCall> {
        vec![
            SinkCall::Submit(IpFamily::V4, script.to_string()),
            SinkCall::Submit(IpFamily::V6, script.to_string()),
        ]
    }

    /// Filter-table directives, each run for IPv4 then IPv6
    pub fn v4v6_runs<S: AsRef<str>>(rules: &[S]) -> Vec<SinkCall> {
        rules
            .iter()
            .flat_map(|rule| {
                [IpFamily::V4, IpFamily::V6]
                    .map(|family| SinkCall::Run(family, Table::Filter, rule.as_ref().to_string()))
            })
            .collect()
    }

    fn next_result(queue: &Mutex<VecDeque<bool>>) -> bool {
        queue.lock().unwrap().pop_front().unwrap_or(true)
    }
}

impl RuleSink for FakeSink {
    fn submit(&self, family: IpFamily, script: &str) -> Result<(), SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Submit(family, script.to_string()));
        if Self::next_result(&self.submit_results) {
            Ok(())
        } else {
            Err(SinkError::with_status("fake submit failure", Some(1)))
        }
    }

    fn run(&self, family: IpFamily, table: Table, directive: &str) -> Result<(), SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::Run(family, table, directive.to_string()));
        if Self::next_result(&self.run_results) {
            Ok(())
        } else {
            Err(SinkError::with_status("fake run failure", Some(1)))
        }
    }

    fn list(&self, family: IpFamily, table: Table, query: &str) -> Result<String, SinkError> {
        self.calls
            .lock()
            .unwrap()
            .push(SinkCall::List(family, table, query.to_string()));
        self.list_outputs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SinkError::new("fake list failure"))
    }
}

/// Records fast-path quota writes
#[derive(Debug, Default)]
pub struct FakeQuota {
    updates: Mutex<Vec<(String, u64)>>,
    fail: Mutex<bool>,
}

impl FakeQuota {
    pub fn take_updates(&self) -> Vec<(String, u64)> {
        std::mem::take(&mut *self.updates.lock().unwrap())
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl QuotaControl for FakeQuota {
    fn update(&self, name: &str, bytes: u64) -> io::Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such quota"));
        }
        self.updates.lock().unwrap().push((name.to_string(), bytes));
        Ok(())
    }
}
