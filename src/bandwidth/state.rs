// Quota State Tracker
//
// Records installed quota rules and shared-group membership. Mutations
// happen only after the engine accepted the rules. Callers hold a KeyGuard
// for the whole decide-then-apply sequence.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock key shared by every operation on the shared-cost group
pub const SHARED_GROUP_KEY: &str = "@shared";
/// Lock key for the global alert and its forward-chain users
pub const GLOBAL_ALERT_KEY: &str = "@globalAlert";

/// How a requested quota relates to the installed one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Nothing installed yet: write the full rule set
    Create,
    /// Installed with another value: update the live threshold only
    UpdateInPlace,
    /// Installed with the same value
    NoOp,
}

impl QuotaDecision {
    pub fn decide(installed: Option<u64>, requested: u64) -> Self {
        match installed {
            None => QuotaDecision::Create,
            Some(current) if current == requested => QuotaDecision::NoOp,
            Some(_) => QuotaDecision::UpdateInPlace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Interface,
    SharedMember,
}

/// An installed quota for one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRecord {
    pub iface: String,
    pub bytes: u64,
    pub kind: QuotaKind,
}

/// Interfaces served by the single shared-cost chain and quota rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedQuotaGroup {
    /// Most recently joined first
    pub members: Vec<String>,
    pub bytes: u64,
}

impl SharedQuotaGroup {
    pub fn refcount(&self) -> usize {
        self.members.len()
    }
}

/// Membership count before and after a join/leave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub before: usize,
    pub after: usize,
}

impl Transition {
    /// The 0→1 transition
    pub fn is_first(&self) -> bool {
        self.before == 0 && self.after == 1
    }

    /// The 1→0 transition
    pub fn is_last(&self) -> bool {
        self.before == 1 && self.after == 0
    }
}

#[derive(Debug, Default)]
struct Tables {
    interfaces: HashMap<String, u64>,
    shared: Option<SharedQuotaGroup>,
    shared_alert: Option<u64>,
    interface_alerts: HashMap<String, u64>,
    global_alert: Option<u64>,
    global_alert_fwd_users: usize,
    accounting_enabled: bool,
}

/// Process-wide record of installed quota and alert rules
#[derive(Debug, Default)]
pub struct QuotaState {
    tables: Mutex<Tables>,
    busy: Mutex<HashSet<String>>,
    released: Condvar,
    topology: RwLock<()>,
}

/// Exclusive hold on one interface or group key
pub struct KeyGuard<'a> {
    state: &'a QuotaState,
    key: String,
    _topology: RwLockReadGuard<'a, ()>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.state.busy.lock().unwrap_or_else(PoisonError::into_inner);
        busy.remove(&self.key);
        self.state.released.notify_all();
    }
}

impl QuotaState {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize all operations touching `key`
    ///
    /// Operations on other keys proceed concurrently.
    pub fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let topology = self.topology.read().unwrap_or_else(PoisonError::into_inner);
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        while busy.contains(key) {
            busy = self
                .released
                .wait(busy)
                .unwrap_or_else(PoisonError::into_inner);
        }
        busy.insert(key.to_string());

        KeyGuard {
            state: self,
            key: key.to_string(),
            _topology: topology,
        }
    }

    /// Exclude every keyed operation, for topology-wide rewrites
    pub fn lock_topology(&self) -> RwLockWriteGuard<'_, ()> {
        self.topology.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget every dynamic rule (after the topology was flushed)
    pub fn reset(&self) {
        let mut tables = self.tables();
        let enabled = tables.accounting_enabled;
        *tables = Tables::default();
        tables.accounting_enabled = enabled;
    }

    pub fn accounting_enabled(&self) -> bool {
        self.tables().accounting_enabled
    }

    pub fn set_accounting_enabled(&self, enabled: bool) {
        self.tables().accounting_enabled = enabled;
    }

    // Per-interface quotas

    pub fn interface_quota(&self, iface: &str) -> Option<QuotaRecord> {
        self.tables().interfaces.get(iface).map(|&bytes| QuotaRecord {
            iface: iface.to_string(),
            bytes,
            kind: QuotaKind::Interface,
        })
    }

    pub fn upsert_interface_quota(&self, iface: &str, bytes: u64) {
        self.tables().interfaces.insert(iface.to_string(), bytes);
    }

    pub fn remove_interface_quota(&self, iface: &str) -> Option<QuotaRecord> {
        let mut tables = self.tables();
        tables.interface_alerts.remove(iface);
        tables.interfaces.remove(iface).map(|bytes| QuotaRecord {
            iface: iface.to_string(),
            bytes,
            kind: QuotaKind::Interface,
        })
    }

    // Shared group

    pub fn shared_group(&self) -> Option<SharedQuotaGroup> {
        self.tables().shared.clone()
    }

    pub fn shared_member(&self, iface: &str) -> Option<QuotaRecord> {
        let tables = self.tables();
        let group = tables.shared.as_ref()?;
        group
            .members
            .iter()
            .any(|m| m == iface)
            .then(|| QuotaRecord {
                iface: iface.to_string(),
                bytes: group.bytes,
                kind: QuotaKind::SharedMember,
            })
    }

    /// Transition a join of `iface` would cause, without applying it
    pub fn preview_join(&self, iface: &str) -> Transition {
        let tables = self.tables();
        match tables.shared.as_ref() {
            None => Transition { before: 0, after: 1 },
            Some(group) if group.members.iter().any(|m| m == iface) => Transition {
                before: group.refcount(),
                after: group.refcount(),
            },
            Some(group) => Transition {
                before: group.refcount(),
                after: group.refcount() + 1,
            },
        }
    }

    /// Transition a leave of `iface` would cause; `None` if not a member
    pub fn preview_leave(&self, iface: &str) -> Option<Transition> {
        let tables = self.tables();
        let group = tables.shared.as_ref()?;
        group.members.iter().any(|m| m == iface).then(|| Transition {
            before: group.refcount(),
            after: group.refcount() - 1,
        })
    }

    /// Add a member; creates the group with `bytes` on the first join
    pub fn join_shared(&self, iface: &str, bytes: u64) -> Transition {
        let mut tables = self.tables();
        let group = tables.shared.get_or_insert_with(|| SharedQuotaGroup {
            members: Vec::new(),
            bytes,
        });
        let before = group.refcount();
        if !group.members.iter().any(|m| m == iface) {
            group.members.insert(0, iface.to_string());
        }
        Transition {
            before,
            after: group.refcount(),
        }
    }

    /// Drop a member; the group (and its alert) disappears at refcount zero
    pub fn leave_shared(&self, iface: &str) -> Option<Transition> {
        let mut tables = self.tables();
        let group = tables.shared.as_mut()?;
        let pos = group.members.iter().position(|m| m == iface)?;
        let before = group.refcount();
        group.members.remove(pos);
        let after = group.refcount();
        if after == 0 {
            tables.shared = None;
            tables.shared_alert = None;
        }
        Some(Transition { before, after })
    }

    pub fn set_shared_bytes(&self, bytes: u64) {
        if let Some(group) = self.tables().shared.as_mut() {
            group.bytes = bytes;
        }
    }

    // Alerts

    pub fn shared_alert(&self) -> Option<u64> {
        self.tables().shared_alert
    }

    pub fn set_shared_alert(&self, bytes: Option<u64>) {
        self.tables().shared_alert = bytes;
    }

    pub fn interface_alert(&self, iface: &str) -> Option<u64> {
        self.tables().interface_alerts.get(iface).copied()
    }

    pub fn set_interface_alert(&self, iface: &str, bytes: Option<u64>) {
        let mut tables = self.tables();
        match bytes {
            Some(bytes) => tables.interface_alerts.insert(iface.to_string(), bytes),
            None => tables.interface_alerts.remove(iface),
        };
    }

    pub fn global_alert(&self) -> Option<u64> {
        self.tables().global_alert
    }

    pub fn set_global_alert(&self, bytes: Option<u64>) {
        self.tables().global_alert = bytes;
    }

    pub fn global_alert_fwd_users(&self) -> usize {
        self.tables().global_alert_fwd_users
    }

    pub fn set_global_alert_fwd_users(&self, users: usize) {
        self.tables().global_alert_fwd_users = users;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_quota_decision() {
        assert_eq!(QuotaDecision::decide(None, 5), QuotaDecision::Create);
        assert_eq!(QuotaDecision::decide(Some(5), 5), QuotaDecision::NoOp);
        assert_eq!(QuotaDecision::decide(Some(5), 6), QuotaDecision::UpdateInPlace);
    }

    #[test]
    fn test_shared_transitions() {
        let state = QuotaState::new();

        assert!(state.preview_join("a").is_first());
        assert!(state.preview_leave("a").is_none());
        let t = state.join_shared("a", 100);
        assert!(t.is_first());
        assert!(state.preview_leave("a").unwrap().is_last());
        let t = state.join_shared("b", 100);
        assert_eq!(t, Transition { before: 1, after: 2 });
        assert!(!t.is_first());

        // Rejoining does not change the refcount
        let t = state.join_shared("b", 100);
        assert_eq!(t, Transition { before: 2, after: 2 });

        assert_eq!(state.shared_group().unwrap().members, vec!["b", "a"]);
        assert_eq!(
            state.shared_member("a").unwrap().kind,
            QuotaKind::SharedMember
        );

        state.set_shared_alert(Some(10));
        let t = state.leave_shared("a").unwrap();
        assert!(!t.is_last());
        assert_eq!(state.shared_alert(), Some(10));

        let t = state.leave_shared("b").unwrap();
        assert!(t.is_last());
        assert!(state.shared_group().is_none());
        assert!(state.shared_alert().is_none());
        assert!(state.leave_shared("b").is_none());
    }

    #[test]
    fn test_interface_records() {
        let state = QuotaState::new();
        assert!(state.interface_quota("wlan0").is_none());

        state.upsert_interface_quota("wlan0", 10);
        state.set_interface_alert("wlan0", Some(5));
        state.upsert_interface_quota("wlan0", 20);
        assert_eq!(state.interface_quota("wlan0").unwrap().bytes, 20);

        let removed = state.remove_interface_quota("wlan0").unwrap();
        assert_eq!(removed.bytes, 20);
        assert!(state.interface_alert("wlan0").is_none());
    }

    #[test]
    fn test_reset_keeps_accounting_flag() {
        let state = QuotaState::new();
        state.set_accounting_enabled(true);
        state.upsert_interface_quota("wlan0", 10);
        state.set_global_alert(Some(1));
        state.reset();
        assert!(state.accounting_enabled());
        assert!(state.interface_quota("wlan0").is_none());
        assert!(state.global_alert().is_none());
    }

    #[test]
    fn test_same_key_is_exclusive() {
        let state = Arc::new(QuotaState::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    let _guard = state.lock_key("wlan0");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_under_lock_matches_preview() {
        let state = Arc::new(QuotaState::new());

        let handles: Vec<_> = ["aTun0", "bTun0"]
            .into_iter()
            .map(|iface| {
                let state = state.clone();
                thread::spawn(move || {
                    let _guard = state.lock_key(SHARED_GROUP_KEY);
                    let planned = state.preview_join(iface);
                    thread::sleep(Duration::from_millis(5));
                    let applied = state.join_shared(iface, 100);
                    assert_eq!(planned, applied);
                    applied
                })
            })
            .collect();

        let transitions: Vec<Transition> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(transitions.iter().filter(|t| t.is_first()).count(), 1);
        assert!(transitions.contains(&Transition { before: 1, after: 2 }));
        assert_eq!(state.shared_group().unwrap().refcount(), 2);

        let _guard = state.lock_key(SHARED_GROUP_KEY);
        for iface in ["aTun0", "bTun0"] {
            let planned = state.preview_leave(iface).unwrap();
            assert_eq!(state.leave_shared(iface), Some(planned));
        }
        assert!(state.shared_group().is_none());
    }

    #[test]
    fn test_different_keys_do_not_block() {
        let state = QuotaState::new();
        let _a = state.lock_key("wlan0");
        let _b = state.lock_key("rmnet0");
    }
}
