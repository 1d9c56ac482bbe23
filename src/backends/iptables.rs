// iptables / ip6tables rule sink

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

use super::{IpFamily, RuleSink, SinkError, Table};

/// Rule sink that shells out to the iptables tool family
///
/// Scripts go through `iptables-restore --noflush` so a whole batch either
/// applies or fails as a unit; single directives and listings go through
/// `iptables -t <table>`.
#[derive(Debug, Clone)]
pub struct IptablesSink {
    iptables: PathBuf,
    ip6tables: PathBuf,
    iptables_restore: PathBuf,
    ip6tables_restore: PathBuf,
}

impl Default for IptablesSink {
    fn default() -> Self {
        Self {
            iptables: PathBuf::from("iptables"),
            ip6tables: PathBuf::from("ip6tables"),
            iptables_restore: PathBuf::from("iptables-restore"),
            ip6tables_restore: PathBuf::from("ip6tables-restore"),
        }
    }
}

impl IptablesSink {
    pub fn new(
        iptables: impl Into<PathBuf>,
        ip6tables: impl Into<PathBuf>,
        iptables_restore: impl Into<PathBuf>,
        ip6tables_restore: impl Into<PathBuf>,
    ) -> Self {
        Self {
            iptables: iptables.into(),
            ip6tables: ip6tables.into(),
            iptables_restore: iptables_restore.into(),
            ip6tables_restore: ip6tables_restore.into(),
        }
    }

    /// Check if the IPv4 tool can be executed at all
    pub fn is_available(&self) -> bool {
        Command::new(&self.iptables).arg("--version").output().is_ok()
    }

    fn tool(&self, family: IpFamily) -> &PathBuf {
        match family {
            IpFamily::V4 => &self.iptables,
            IpFamily::V6 => &self.ip6tables,
        }
    }

    fn restore_tool(&self, family: IpFamily) -> &PathBuf {
        match family {
            IpFamily::V4 => &self.iptables_restore,
            IpFamily::V6 => &self.ip6tables_restore,
        }
    }

    fn exec(&self, family: IpFamily, table: Table, directive: &str) -> Result<Output, SinkError> {
        let tool = self.tool(family);
        let output = Command::new(tool)
            .arg("-w")
            .args(["-t", table.as_str()])
            .args(directive.split_whitespace())
            .output()
            .map_err(|e| SinkError::new(format!("failed to run {}: {}", tool.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SinkError::with_status(
                format!(
                    "{} -t {} {} failed: {}",
                    tool.display(),
                    table,
                    directive,
                    stderr.trim()
                ),
                output.status.code(),
            ));
        }

        Ok(output)
    }
}

impl RuleSink for IptablesSink {
    fn submit(&self, family: IpFamily, script: &str) -> Result<(), SinkError> {
        let tool = self.restore_tool(family);
        let mut child = Command::new(tool)
            .args(["--noflush", "-w"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SinkError::new(format!("failed to spawn {}: {}", tool.display(), e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .map_err(|e| SinkError::new(format!("failed to feed {}: {}", tool.display(), e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| SinkError::new(format!("failed to wait for {}: {}", tool.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SinkError::with_status(
                format!("{} rejected batch: {}", tool.display(), stderr.trim()),
                output.status.code(),
            ));
        }

        Ok(())
    }

    fn run(&self, family: IpFamily, table: Table, directive: &str) -> Result<(), SinkError> {
        self.exec(family, table, directive).map(|_| ())
    }

    fn list(&self, family: IpFamily, table: Table, query: &str) -> Result<String, SinkError> {
        let output = self.exec(family, table, query)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
