// Fixed chain topology used for bandwidth accounting

use crate::backends::Table;

pub const LOCAL_INPUT: &str = "bw_INPUT";
pub const LOCAL_OUTPUT: &str = "bw_OUTPUT";
pub const LOCAL_FORWARD: &str = "bw_FORWARD";
pub const HAPPY_BOX: &str = "bw_happy_box";
pub const PENALTY_BOX: &str = "bw_penalty_box";
pub const DATA_SAVER: &str = "bw_data_saver";
pub const COSTLY_SHARED: &str = "bw_costly_shared";
pub const RAW_PREROUTING: &str = "bw_raw_PREROUTING";
pub const MANGLE_POSTROUTING: &str = "bw_mangle_POSTROUTING";

/// Prefix of per-interface costly chains
pub const COSTLY_PREFIX: &str = "bw_costly_";

/// Quota name of the shared-cost group
pub const SHARED_QUOTA_NAME: &str = "shared";
pub const SHARED_ALERT_NAME: &str = "sharedAlert";
pub const GLOBAL_ALERT_NAME: &str = "globalAlert";

/// Chain that NAT/tethering maintains with per-pair RETURN counters
pub const TETHER_COUNTERS: &str = "natctrl_tether_counters";

/// UIDs below this bound belong to the system and are never penalised
pub const FIRST_APPLICATION_UID: u32 = 10000;

/// Static chains, grouped by table in declaration order
pub const STATIC_CHAINS: &[(Table, &[&str])] = &[
    (
        Table::Filter,
        &[
            LOCAL_INPUT,
            LOCAL_OUTPUT,
            LOCAL_FORWARD,
            HAPPY_BOX,
            PENALTY_BOX,
            DATA_SAVER,
            COSTLY_SHARED,
        ],
    ),
    (Table::Raw, &[RAW_PREROUTING]),
    (Table::Mangle, &[MANGLE_POSTROUTING]),
];

/// Name of the dedicated costly chain for an interface
pub fn costly_chain(iface: &str) -> String {
    format!("{}{}", COSTLY_PREFIX, iface)
}

/// Name of the alert rule attached to an interface's costly chain
pub fn interface_alert_name(iface: &str) -> String {
    format!("{}Alert", iface)
}

/// Whether per-interface rules for `iface` would reuse a name owned by the
/// shared group or the global alert
pub fn is_reserved_iface(iface: &str) -> bool {
    let alert = interface_alert_name(iface);
    costly_chain(iface) == COSTLY_SHARED
        || iface == SHARED_QUOTA_NAME
        || [SHARED_ALERT_NAME, GLOBAL_ALERT_NAME].contains(&alert.as_str())
}

/// Extract stale per-interface costly chains from `-S` output
///
/// Matches `-N bw_costly_<iface>` declarations, skipping the shared chain.
pub fn stale_costly_chains(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix("-N "))
        .map(str::trim)
        .filter(|chain| chain.starts_with(COSTLY_PREFIX) && *chain != COSTLY_SHARED)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_iface() {
        assert!(is_reserved_iface("shared"));
        assert!(is_reserved_iface("global"));
        assert!(!is_reserved_iface("rmnet0"));
        assert!(!is_reserved_iface("shared0"));
        assert!(!is_reserved_iface("globalAlert"));
    }

    #[test]
    fn test_stale_costly_chains() {
        let listing = "-P OUTPUT ACCEPT\n\
                       -N bw_costly_rmnet_data0\n\
                       -N bw_costly_shared\n\
                       -N unrelated\n\
                       -N bw_costly_rmnet_data7\n";
        assert_eq!(
            stale_costly_chains(listing),
            vec!["bw_costly_rmnet_data0", "bw_costly_rmnet_data7"]
        );
    }

    #[test]
    fn test_stale_costly_chains_ignores_rules() {
        let listing = "-A bw_INPUT -i wlan0 --jump bw_costly_wlan0\n-N bw_costly_shared\n";
        assert!(stale_costly_chains(listing).is_empty());
    }

    #[test]
    fn test_chain_names() {
        assert_eq!(costly_chain("rmnet0"), "bw_costly_rmnet0");
        assert_eq!(interface_alert_name("rmnet0"), "rmnet0Alert");
    }
}
