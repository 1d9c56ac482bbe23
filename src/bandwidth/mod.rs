// Bandwidth accounting, quota and alert management
//
// bw_INPUT / bw_OUTPUT / bw_FORWARD
//   -i/-o <iface> -> bw_costly_<iface> | bw_costly_shared
//     -> bw_penalty_box -> bw_happy_box -> bw_data_saver

pub mod chains;
pub mod executor;
pub mod rules;
pub mod state;

use std::io::Write;
use std::sync::Arc;

use crate::backends::{IpFamily, QuotaControl, RuleSink, Table};
use crate::error::{BandwidthError, Result};
use crate::protocol::{self, ResponseLine};
use crate::tether::{self, TetherStatsFilter};
use chains::*;
use executor::Executor;
use rules::{AppList, RuleOp, Script};
use state::{GLOBAL_ALERT_KEY, QuotaDecision, QuotaState, SHARED_GROUP_KEY};

const DATA_SAVER_KEY: &str = "@dataSaver";
const APPS_KEY: &str = "@apps";

/// Interface names follow the kernel's IFNAMSIZ limit
const MAX_IFACE_LEN: usize = 15;
const MAX_QUOTA_NAME_LEN: usize = 64;

pub struct BandwidthController {
    executor: Executor,
    quota_control: Arc<dyn QuotaControl>,
    state: QuotaState,
}

impl BandwidthController {
    pub fn new(sink: Arc<dyn RuleSink>, quota_control: Arc<dyn QuotaControl>) -> Self {
        Self {
            executor: Executor::new(sink),
            quota_control,
            state: QuotaState::new(),
        }
    }

    pub fn state(&self) -> &QuotaState {
        &self.state
    }

    pub fn is_accounting_enabled(&self) -> bool {
        self.state.accounting_enabled()
    }

    fn update_quota(&self, name: &str, bytes: u64) -> Result<()> {
        self.quota_control.update(name, bytes).map_err(|source| {
            log::error!("Failed to update quota {} to {}: {}", name, bytes, source);
            BandwidthError::QuotaUpdate {
                name: name.to_string(),
                source,
            }
        })
    }

    /// Remove costly chains from a previous run and re-declare the static topology
    ///
    /// `delete_stale` controls whether stale chains are deleted or only flushed.
    fn reconcile_topology(&self, delete_stale: bool, extra: Option<Script>) -> Result<()> {
        let listing = self
            .executor
            .list(IpFamily::V4, Table::Filter, rules::LIST_CHAINS)?;
        let stale = stale_costly_chains(&listing);
        if !stale.is_empty() {
            log::info!("Cleaning up {} stale costly chain(s): {:?}", stale.len(), stale);
        }

        let mut scripts = Vec::new();
        scripts.extend(rules::cleanup_script(&stale, delete_stale));
        scripts.push(rules::static_topology_script());
        scripts.extend(extra);

        self.executor.commit(&scripts)
    }

    /// Reconcile the chain topology on start, without enabling accounting
    pub fn setup_hooks(&self) -> Result<()> {
        let _topology = self.state.lock_topology();
        self.reconcile_topology(true, None)?;
        self.state.reset();
        self.state.set_accounting_enabled(false);
        log::info!("Bandwidth chain topology set up");
        Ok(())
    }

    /// Flush the topology and install the default accounting rules
    ///
    /// Does nothing when accounting is already on, unless `force` is set.
    pub fn enable_accounting(&self, force: bool) -> Result<()> {
        let _topology = self.state.lock_topology();
        if self.state.accounting_enabled() && !force {
            log::debug!("Bandwidth accounting already enabled");
            return Ok(());
        }

        self.reconcile_topology(true, Some(rules::accounting_script()))?;
        self.state.reset();
        self.state.set_accounting_enabled(true);
        log::info!("Bandwidth accounting enabled");
        Ok(())
    }

    /// Flush every bandwidth chain, leaving the structure in place
    pub fn disable_accounting(&self) -> Result<()> {
        let _topology = self.state.lock_topology();
        self.reconcile_topology(false, None)?;
        self.state.reset();
        self.state.set_accounting_enabled(false);
        log::info!("Bandwidth accounting disabled");
        Ok(())
    }

    pub fn enable_data_saver(&self, enable: bool) -> Result<()> {
        let _guard = self.state.lock_key(DATA_SAVER_KEY);
        self.executor.commit(&[rules::data_saver_script(enable)])?;
        log::info!("Data saver {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    // Per-interface quotas

    pub fn set_interface_quota(&self, iface: &str, bytes: u64) -> Result<()> {
        validate_costly_iface(iface)?;
        validate_bytes(bytes)?;
        let _guard = self.state.lock_key(iface);

        let installed = self.state.interface_quota(iface).map(|r| r.bytes);
        match QuotaDecision::decide(installed, bytes) {
            QuotaDecision::NoOp => {
                log::debug!("Quota for {} already {} bytes", iface, bytes);
            }
            QuotaDecision::UpdateInPlace => {
                self.update_quota(iface, bytes)?;
                self.state.upsert_interface_quota(iface, bytes);
                log::info!("Updated quota for {} to {} bytes", iface, bytes);
            }
            QuotaDecision::Create => {
                self.executor.prep_costly_chain(&costly_chain(iface))?;
                self.executor.apply(&rules::interface_quota_directives(iface, bytes))?;
                self.state.upsert_interface_quota(iface, bytes);
                log::info!("Installed quota of {} bytes on {}", bytes, iface);
            }
        }
        Ok(())
    }

    pub fn remove_interface_quota(&self, iface: &str) -> Result<()> {
        validate_costly_iface(iface)?;
        let _guard = self.state.lock_key(iface);

        if self.state.interface_quota(iface).is_none() {
            log::error!("No quota installed on {}", iface);
            return Err(BandwidthError::NotFound(format!("quota on {}", iface)));
        }

        self.executor.apply(&rules::remove_interface_quota_directives(iface))?;
        self.state.remove_interface_quota(iface);
        log::info!("Removed quota on {}", iface);
        Ok(())
    }

    // Shared quota group

    pub fn set_interface_shared_quota(&self, iface: &str, bytes: u64) -> Result<()> {
        validate_iface(iface)?;
        validate_bytes(bytes)?;
        let _guard = self.state.lock_key(SHARED_GROUP_KEY);

        let planned = self.state.preview_join(iface);
        if planned.after != planned.before {
            let mut directives = rules::costly_hook_directives(iface, COSTLY_SHARED);
            if planned.is_first() {
                directives.push(rules::shared_quota_directive(RuleOp::Insert, bytes));
            }
            self.executor.apply(&directives)?;

            let applied = self.state.join_shared(iface, bytes);
            debug_assert_eq!(applied, planned);
            if applied.is_first() {
                log::info!("Installed shared quota of {} bytes", bytes);
            }
            log::info!("{} joined shared quota ({} member(s))", iface, applied.after);
        }

        let group_bytes = self.state.shared_group().map(|g| g.bytes);
        if QuotaDecision::decide(group_bytes, bytes) == QuotaDecision::UpdateInPlace {
            self.update_quota(SHARED_QUOTA_NAME, bytes)?;
            self.state.set_shared_bytes(bytes);
            log::info!("Updated shared quota to {} bytes", bytes);
        }
        Ok(())
    }

    pub fn remove_interface_shared_quota(&self, iface: &str) -> Result<()> {
        validate_iface(iface)?;
        let _guard = self.state.lock_key(SHARED_GROUP_KEY);

        let (Some(member), Some(planned)) =
            (self.state.shared_member(iface), self.state.preview_leave(iface))
        else {
            log::error!("{} is not part of the shared quota", iface);
            return Err(BandwidthError::NotFound(format!("shared quota member {}", iface)));
        };

        if planned.is_last() {
            if let Some(alert) = self.state.shared_alert() {
                self.executor.commit(&[rules::costly_alert_script(
                    RuleOp::Delete,
                    COSTLY_SHARED,
                    SHARED_ALERT_NAME,
                    alert,
                )])?;
                self.state.set_shared_alert(None);
            }
        }

        let mut directives = rules::remove_costly_hook_directives(iface, COSTLY_SHARED);
        if planned.is_last() {
            directives.push(rules::shared_quota_directive(RuleOp::Delete, member.bytes));
        }
        self.executor.apply(&directives)?;

        let applied = self.state.leave_shared(iface);
        debug_assert_eq!(applied, Some(planned));
        if applied.is_some_and(|t| t.is_last()) {
            log::info!("Removed shared quota");
        }
        log::info!("{} left shared quota", iface);
        Ok(())
    }

    // Alerts

    /// Insert or delete a named alert on the local input and output chains
    pub fn run_alert_cmd(&self, op: RuleOp, name: &str, bytes: u64) -> Result<()> {
        validate_quota_name(name)?;
        self.executor.commit(&[rules::alert_script(op, name, bytes)])
    }

    /// Insert or delete a named alert on the forward chain
    pub fn run_alert_fwd_cmd(&self, op: RuleOp, name: &str, bytes: u64) -> Result<()> {
        validate_quota_name(name)?;
        self.executor.commit(&[rules::alert_fwd_script(op, name, bytes)])
    }

    pub fn set_global_alert(&self, bytes: u64) -> Result<()> {
        validate_bytes(bytes)?;
        let _guard = self.state.lock_key(GLOBAL_ALERT_KEY);

        match QuotaDecision::decide(self.state.global_alert(), bytes) {
            QuotaDecision::NoOp => {}
            QuotaDecision::UpdateInPlace => {
                self.update_quota(GLOBAL_ALERT_NAME, bytes)?;
                self.state.set_global_alert(Some(bytes));
            }
            QuotaDecision::Create => {
                self.run_alert_cmd(RuleOp::Insert, GLOBAL_ALERT_NAME, bytes)?;
                if self.state.global_alert_fwd_users() > 0 {
                    self.run_alert_fwd_cmd(RuleOp::Insert, GLOBAL_ALERT_NAME, bytes)?;
                }
                self.state.set_global_alert(Some(bytes));
                log::info!("Global alert set at {} bytes", bytes);
            }
        }
        Ok(())
    }

    pub fn remove_global_alert(&self) -> Result<()> {
        let _guard = self.state.lock_key(GLOBAL_ALERT_KEY);

        let bytes = self
            .state
            .global_alert()
            .ok_or_else(|| BandwidthError::NotFound("global alert".to_string()))?;
        self.run_alert_cmd(RuleOp::Delete, GLOBAL_ALERT_NAME, bytes)?;
        if self.state.global_alert_fwd_users() > 0 {
            self.run_alert_fwd_cmd(RuleOp::Delete, GLOBAL_ALERT_NAME, bytes)?;
        }
        self.state.set_global_alert(None);
        log::info!("Global alert removed");
        Ok(())
    }

    /// Count one more forward-chain user of the global alert
    pub fn set_global_alert_in_forward_chain(&self) -> Result<()> {
        let _guard = self.state.lock_key(GLOBAL_ALERT_KEY);

        let users = self.state.global_alert_fwd_users();
        if users == 0 {
            if let Some(bytes) = self.state.global_alert() {
                self.run_alert_fwd_cmd(RuleOp::Insert, GLOBAL_ALERT_NAME, bytes)?;
            }
        }
        self.state.set_global_alert_fwd_users(users + 1);
        Ok(())
    }

    pub fn remove_global_alert_in_forward_chain(&self) -> Result<()> {
        let _guard = self.state.lock_key(GLOBAL_ALERT_KEY);

        let users = self.state.global_alert_fwd_users();
        if users == 0 {
            return Err(BandwidthError::NotFound(
                "global alert forward chain user".to_string(),
            ));
        }
        if users == 1 {
            if let Some(bytes) = self.state.global_alert() {
                self.run_alert_fwd_cmd(RuleOp::Delete, GLOBAL_ALERT_NAME, bytes)?;
            }
        }
        self.state.set_global_alert_fwd_users(users - 1);
        Ok(())
    }

    pub fn set_shared_alert(&self, bytes: u64) -> Result<()> {
        validate_bytes(bytes)?;
        let _guard = self.state.lock_key(SHARED_GROUP_KEY);

        if self.state.shared_group().is_none() {
            log::error!("Shared alert requires an active shared quota");
            return Err(BandwidthError::NotFound("shared quota".to_string()));
        }

        match QuotaDecision::decide(self.state.shared_alert(), bytes) {
            QuotaDecision::NoOp => {}
            QuotaDecision::UpdateInPlace => {
                self.update_quota(SHARED_ALERT_NAME, bytes)?;
                self.state.set_shared_alert(Some(bytes));
            }
            QuotaDecision::Create => {
                self.executor.commit(
                    &[rules::costly_alert_script(
                        RuleOp::Append,
                        COSTLY_SHARED,
                        SHARED_ALERT_NAME,
                        bytes,
                    )],
                )?;
                self.state.set_shared_alert(Some(bytes));
            }
        }
        Ok(())
    }

    pub fn remove_shared_alert(&self) -> Result<()> {
        let _guard = self.state.lock_key(SHARED_GROUP_KEY);

        let bytes = self
            .state
            .shared_alert()
            .ok_or_else(|| BandwidthError::NotFound("shared alert".to_string()))?;
        self.executor.commit(
            &[rules::costly_alert_script(
                RuleOp::Delete,
                COSTLY_SHARED,
                SHARED_ALERT_NAME,
                bytes,
            )],
        )?;
        self.state.set_shared_alert(None);
        Ok(())
    }

    pub fn set_interface_alert(&self, iface: &str, bytes: u64) -> Result<()> {
        validate_costly_iface(iface)?;
        validate_bytes(bytes)?;
        let _guard = self.state.lock_key(iface);

        if self.state.interface_quota(iface).is_none() {
            log::error!("Interface alert on {} requires a quota", iface);
            return Err(BandwidthError::NotFound(format!("quota on {}", iface)));
        }

        let name = interface_alert_name(iface);
        match QuotaDecision::decide(self.state.interface_alert(iface), bytes) {
            QuotaDecision::NoOp => {}
            QuotaDecision::UpdateInPlace => {
                self.update_quota(&name, bytes)?;
                self.state.set_interface_alert(iface, Some(bytes));
            }
            QuotaDecision::Create => {
                self.executor.commit(
                    &[rules::costly_alert_script(
                        RuleOp::Append,
                        &costly_chain(iface),
                        &name,
                        bytes,
                    )],
                )?;
                self.state.set_interface_alert(iface, Some(bytes));
            }
        }
        Ok(())
    }

    pub fn remove_interface_alert(&self, iface: &str) -> Result<()> {
        validate_costly_iface(iface)?;
        let _guard = self.state.lock_key(iface);

        let bytes = self
            .state
            .interface_alert(iface)
            .ok_or_else(|| BandwidthError::NotFound(format!("alert on {}", iface)))?;
        self.executor.commit(
            &[rules::costly_alert_script(
                RuleOp::Delete,
                &costly_chain(iface),
                &interface_alert_name(iface),
                bytes,
            )],
        )?;
        self.state.set_interface_alert(iface, None);
        Ok(())
    }

    // Nice / naughty apps

    fn manipulate_apps<S: AsRef<str>>(&self, list: AppList, op: RuleOp, uids: &[S]) -> Result<()> {
        let uids = parse_uids(uids)?;
        let _guard = self.state.lock_key(APPS_KEY);
        self.executor.commit(&[rules::app_script(list, op, &uids)])
    }

    pub fn add_nice_apps<S: AsRef<str>>(&self, uids: &[S]) -> Result<()> {
        self.manipulate_apps(AppList::Nice, RuleOp::Insert, uids)
    }

    pub fn remove_nice_apps<S: AsRef<str>>(&self, uids: &[S]) -> Result<()> {
        self.manipulate_apps(AppList::Nice, RuleOp::Delete, uids)
    }

    pub fn add_naughty_apps<S: AsRef<str>>(&self, uids: &[S]) -> Result<()> {
        self.manipulate_apps(AppList::Naughty, RuleOp::Insert, uids)
    }

    pub fn remove_naughty_apps<S: AsRef<str>>(&self, uids: &[S]) -> Result<()> {
        self.manipulate_apps(AppList::Naughty, RuleOp::Delete, uids)
    }

    // Tethering stats

    /// Build the response lines for a tether stats query
    pub fn tether_stats(&self, filter: &TetherStatsFilter) -> Result<Vec<ResponseLine>> {
        tether::query(&self.executor, filter)
    }

    /// Query tether stats and stream the response to `client`
    ///
    /// Nothing is written when the query fails.
    pub fn get_tether_stats(&self, client: &mut dyn Write, filter: &TetherStatsFilter) -> Result<()> {
        let lines = self.tether_stats(filter)?;
        protocol::write_response(client, &lines)?;
        Ok(())
    }
}

fn validate_iface(iface: &str) -> Result<()> {
    let mut chars = iface.chars();
    let valid = iface.len() <= MAX_IFACE_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.'));
    if !valid {
        log::error!("Invalid interface name {:?}", iface);
        return Err(BandwidthError::InvalidArgument(format!(
            "interface name {:?}",
            iface
        )));
    }
    Ok(())
}

/// Interface that gets its own costly chain and alert
fn validate_costly_iface(iface: &str) -> Result<()> {
    validate_iface(iface)?;
    if is_reserved_iface(iface) {
        log::error!("Interface name {:?} collides with a reserved rule name", iface);
        return Err(BandwidthError::InvalidArgument(format!(
            "reserved interface name {:?}",
            iface
        )));
    }
    Ok(())
}

fn validate_quota_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_QUOTA_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !valid {
        return Err(BandwidthError::InvalidArgument(format!(
            "quota name {:?}",
            name
        )));
    }
    Ok(())
}

fn validate_bytes(bytes: u64) -> Result<()> {
    if bytes == 0 {
        return Err(BandwidthError::InvalidArgument(
            "byte count must be non-zero".to_string(),
        ));
    }
    Ok(())
}

fn parse_uids<S: AsRef<str>>(uids: &[S]) -> Result<Vec<u32>> {
    if uids.is_empty() {
        return Err(BandwidthError::InvalidArgument("no app uids given".to_string()));
    }
    uids.iter()
        .map(|uid| {
            let uid = uid.as_ref();
            uid.parse::<u32>()
                .map_err(|_| BandwidthError::InvalidArgument(format!("app uid {:?}", uid)))
        })
        .collect()
}
