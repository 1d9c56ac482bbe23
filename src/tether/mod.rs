// Tethering statistics, read live from natctrl_tether_counters on every query

pub mod parser;

use crate::backends::{IpFamily, Table};
use crate::bandwidth::executor::Executor;
use crate::bandwidth::rules;
use crate::error::{BandwidthError, Result};
use crate::protocol::{ResponseCode, ResponseLine};
use parser::{Aggregator, DumpError, TetherStats};

/// Unconstrained numeric filter field
pub const ANY: i64 = -1;

/// Selects which aggregated pairs a query reports
///
/// Empty interface names select list mode; naming either interface
/// selects lookup mode. Numeric fields set to [`ANY`] match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TetherStatsFilter {
    pub iface_a: String,
    pub iface_b: String,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
}

impl Default for TetherStatsFilter {
    fn default() -> Self {
        Self {
            iface_a: String::new(),
            iface_b: String::new(),
            rx_bytes: ANY,
            rx_packets: ANY,
            tx_bytes: ANY,
            tx_packets: ANY,
        }
    }
}

fn counter_matches(wanted: i64, value: u64) -> bool {
    wanted == ANY || u64::try_from(wanted).is_ok_and(|w| w == value)
}

fn name_matches(wanted: &str, value: &str) -> bool {
    wanted.is_empty() || wanted == value
}

impl TetherStatsFilter {
    /// Lookup of a single pair
    pub fn pair(iface_a: impl Into<String>, iface_b: impl Into<String>) -> Self {
        Self {
            iface_a: iface_a.into(),
            iface_b: iface_b.into(),
            ..Self::default()
        }
    }

    pub fn is_lookup(&self) -> bool {
        !self.iface_a.is_empty() || !self.iface_b.is_empty()
    }

    pub fn matches_counters(&self, stats: &TetherStats) -> bool {
        counter_matches(self.rx_bytes, stats.rx_bytes)
            && counter_matches(self.rx_packets, stats.rx_packets)
            && counter_matches(self.tx_bytes, stats.tx_bytes)
            && counter_matches(self.tx_packets, stats.tx_packets)
    }

    /// The record as seen in the requested orientation, if it matches
    pub fn select(&self, stats: &TetherStats) -> Option<TetherStats> {
        let oriented = if name_matches(&self.iface_a, &stats.iface_a)
            && name_matches(&self.iface_b, &stats.iface_b)
        {
            stats.clone()
        } else if name_matches(&self.iface_a, &stats.iface_b)
            && name_matches(&self.iface_b, &stats.iface_a)
        {
            stats.reversed()
        } else {
            return None;
        };

        self.matches_counters(&oriented).then_some(oriented)
    }
}

/// Read, parse and aggregate both families, then shape the response
///
/// Returns the complete response; nothing is produced on failure.
pub fn query(executor: &Executor, filter: &TetherStatsFilter) -> Result<Vec<ResponseLine>> {
    let request = rules::tether_counters_query();
    let mut aggregator = Aggregator::new();

    for family in IpFamily::ALL {
        let dump = executor.list(family, Table::Filter, &request)?;
        let parsed = parser::parse_family(&dump)
            .and_then(|stats| stats.iter().try_for_each(|s| aggregator.add(s)));
        match parsed {
            Ok(()) => {}
            Err(DumpError::HeaderMissing) if filter.is_lookup() => {
                log::debug!("No {} tether counters, skipping", family);
            }
            Err(e) => {
                log::error!("Failed to parse {} tether counters: {}", family, e);
                return Err(BandwidthError::StatsParse { family, raw: dump });
            }
        }
    }

    if filter.is_lookup() {
        let found = aggregator.records().iter().find_map(|s| filter.select(s));
        return Ok(match found {
            Some(stats) => vec![ResponseLine::new(
                ResponseCode::TetheringStatsResult,
                stats.to_string(),
            )],
            None => vec![ResponseLine::stats_completed()],
        });
    }

    if aggregator.is_empty() {
        log::error!("Expected at least one tether interface pair");
        return Err(BandwidthError::EmptyStats);
    }

    let mut lines: Vec<ResponseLine> = aggregator
        .records()
        .iter()
        .filter(|s| filter.matches_counters(s))
        .map(|s| ResponseLine::new(ResponseCode::TetheringStatsListResult, s.to_string()))
        .collect();
    lines.push(ResponseLine::stats_completed());
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::parser::tests::{IPV4_COUNTERS, IPV6_COUNTERS};
    use super::*;
    use crate::bandwidth::BandwidthController;
    use crate::testing::{FakeQuota, FakeSink};
    use std::sync::Arc;

    fn controller() -> (BandwidthController, Arc<FakeSink>) {
        let sink = Arc::new(FakeSink::default());
        let bw = BandwidthController::new(sink.clone(), Arc::new(FakeQuota::default()));
        (bw, sink)
    }

    fn push_dumps(sink: &FakeSink, dumps: &[&str]) {
        sink.clear_list_outputs();
        for dump in dumps {
            sink.push_list_output(dump);
        }
    }

    fn response(bw: &BandwidthController, filter: &TetherStatsFilter) -> Result<String> {
        let mut out = Vec::new();
        bw.get_tether_stats(&mut out, filter)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_list_requires_both_families() {
        let (bw, sink) = controller();
        let filter = TetherStatsFilter::default();

        // The second listing cannot be executed
        push_dumps(&sink, &[IPV4_COUNTERS]);
        let mut out = Vec::new();
        assert!(bw.get_tether_stats(&mut out, &filter).is_err());
        assert!(out.is_empty());

        push_dumps(&sink, &[IPV6_COUNTERS]);
        assert!(response(&bw, &filter).is_err());
    }

    #[test]
    fn test_list_sums_families() {
        let (bw, sink) = controller();
        push_dumps(&sink, &[IPV4_COUNTERS, IPV6_COUNTERS]);

        assert_eq!(
            response(&bw, &TetherStatsFilter::default()).unwrap(),
            "114 wlan0 rmnet0 10002373 10026 20002002 20027\n\
             114 bt-pan rmnet0 107471 1040 1708806 1450\n\
             200 Tethering stats list completed\n"
        );
    }

    #[test]
    fn test_lookup() {
        let (bw, sink) = controller();

        push_dumps(&sink, &[IPV4_COUNTERS, IPV6_COUNTERS]);
        assert_eq!(
            response(&bw, &TetherStatsFilter::pair("bt-pan", "rmnet0")).unwrap(),
            "221 bt-pan rmnet0 107471 1040 1708806 1450\n"
        );

        push_dumps(&sink, &[IPV4_COUNTERS, IPV6_COUNTERS]);
        assert_eq!(
            response(&bw, &TetherStatsFilter::pair("wlan0", "rmnet0")).unwrap(),
            "221 wlan0 rmnet0 10002373 10026 20002002 20027\n"
        );

        // Reverse orientation swaps rx and tx
        push_dumps(&sink, &[IPV4_COUNTERS, IPV6_COUNTERS]);
        assert_eq!(
            response(&bw, &TetherStatsFilter::pair("rmnet0", "bt-pan")).unwrap(),
            "221 rmnet0 bt-pan 1708806 1450 107471 1040\n"
        );
    }

    #[test]
    fn test_lookup_without_match() {
        let (bw, sink) = controller();
        let filter = TetherStatsFilter::pair("rmnet0", "foo0");

        push_dumps(&sink, &[IPV4_COUNTERS, IPV6_COUNTERS]);
        assert_eq!(
            response(&bw, &filter).unwrap(),
            "200 Tethering stats list completed\n"
        );

        push_dumps(&sink, &["", ""]);
        assert_eq!(
            response(&bw, &filter).unwrap(),
            "200 Tethering stats list completed\n"
        );

        push_dumps(&sink, &["foo", "foo"]);
        assert_eq!(
            response(&bw, &filter).unwrap(),
            "200 Tethering stats list completed\n"
        );
    }

    #[test]
    fn test_list_fails_on_headerless_family() {
        let (bw, sink) = controller();
        let filter = TetherStatsFilter::default();

        push_dumps(&sink, &["", IPV6_COUNTERS]);
        assert!(matches!(
            response(&bw, &filter),
            Err(BandwidthError::StatsParse { .. })
        ));

        push_dumps(&sink, &[IPV4_COUNTERS, ""]);
        assert!(matches!(
            response(&bw, &filter),
            Err(BandwidthError::StatsParse { .. })
        ));
    }

    #[test]
    fn test_single_pair_and_unpaired_row() {
        let (bw, sink) = controller();
        let filter = TetherStatsFilter::default();

        let lines: Vec<&str> = IPV4_COUNTERS.lines().collect();
        let counters = format!("{}\n", lines[..4].join("\n"));
        push_dumps(&sink, &[counters.as_str(), counters.as_str()]);
        assert_eq!(
            response(&bw, &filter).unwrap(),
            "114 wlan0 rmnet0 4746 52 4004 54\n\
             200 Tethering stats list completed\n"
        );

        let counters = format!("{}\n", lines[..3].join("\n"));
        push_dumps(&sink, &[counters.as_str(), counters.as_str()]);
        let mut out = Vec::new();
        let err = bw.get_tether_stats(&mut out, &filter).unwrap_err();
        assert!(out.is_empty());
        assert_eq!(err.diagnostic(), Some(counters.as_str()));
    }

    #[test]
    fn test_counter_overflow_is_reported() {
        let (bw, sink) = controller();
        let dump = |any_addr: &str| {
            format!(
                "Chain natctrl_tether_counters (2 references)\n\
                 \x20   pkts      bytes target     prot opt in     out     source               destination\n\
                 \x20      1 18446744073709551615 RETURN all -- wlan0 rmnet0 {0} {0}\n\
                 \x20      1 1 RETURN all -- rmnet0 wlan0 {0} {0}\n",
                any_addr
            )
        };
        let v4 = dump("0.0.0.0/0");
        let v6 = dump("::/0");

        for filter in [
            TetherStatsFilter::default(),
            TetherStatsFilter::pair("wlan0", "rmnet0"),
        ] {
            push_dumps(&sink, &[v4.as_str(), v6.as_str()]);
            let mut out = Vec::new();
            let err = bw.get_tether_stats(&mut out, &filter).unwrap_err();
            assert!(out.is_empty());
            assert!(matches!(
                err,
                BandwidthError::StatsParse {
                    family: crate::backends::IpFamily::V6,
                    ..
                }
            ));
            assert_eq!(err.diagnostic(), Some(v6.as_str()));
        }
    }

    #[test]
    fn test_empty_list_is_an_error() {
        let (bw, sink) = controller();
        let header: String = IPV4_COUNTERS.lines().take(2).collect::<Vec<_>>().join("\n");

        push_dumps(&sink, &[header.as_str(), header.as_str()]);
        assert!(matches!(
            response(&bw, &TetherStatsFilter::default()),
            Err(BandwidthError::EmptyStats)
        ));
    }

    #[test]
    fn test_numeric_filter_in_list_mode() {
        let (bw, sink) = controller();
        push_dumps(&sink, &[IPV4_COUNTERS, IPV6_COUNTERS]);

        let filter = TetherStatsFilter {
            rx_packets: 1040,
            ..TetherStatsFilter::default()
        };
        assert_eq!(
            response(&bw, &filter).unwrap(),
            "114 bt-pan rmnet0 107471 1040 1708806 1450\n\
             200 Tethering stats list completed\n"
        );

        push_dumps(&sink, &[IPV4_COUNTERS, IPV6_COUNTERS]);
        let filter = TetherStatsFilter {
            tx_bytes: 1,
            ..TetherStatsFilter::default()
        };
        assert_eq!(
            response(&bw, &filter).unwrap(),
            "200 Tethering stats list completed\n"
        );
    }

    #[test]
    fn test_queries_use_counter_listing() {
        let (bw, sink) = controller();
        push_dumps(&sink, &[IPV4_COUNTERS, IPV6_COUNTERS]);
        response(&bw, &TetherStatsFilter::default()).unwrap();

        let calls = sink.take_calls();
        assert_eq!(
            calls,
            vec![
                crate::testing::SinkCall::List(
                    crate::backends::IpFamily::V4,
                    Table::Filter,
                    "-nvx -L natctrl_tether_counters".to_string()
                ),
                crate::testing::SinkCall::List(
                    crate::backends::IpFamily::V6,
                    Table::Filter,
                    "-nvx -L natctrl_tether_counters".to_string()
                ),
            ]
        );
    }
}
