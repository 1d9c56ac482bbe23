// Tether counter dump parsing and per-pair aggregation

use std::fmt;

/// Fields in a data row of `-nvx -L` output, counting back from the end:
/// `... in out source destination`
const IN_FROM_END: usize = 4;
const OUT_FROM_END: usize = 3;
/// IPv6 listings drop the `opt` column, so rows have 8 or 9 fields
const MIN_ROW_FIELDS: usize = 8;

/// One RETURN rule of the tether counters chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRow {
    pub iface_in: String,
    pub iface_out: String,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpError {
    #[error("counter dump has no header")]
    HeaderMissing,

    #[error("malformed counter row: {0:?}")]
    MalformedRow(String),

    #[error("odd number of counter rows ({0})")]
    OddRowCount(usize),

    #[error("no reverse row for {iface_in} -> {iface_out}")]
    Unpaired { iface_in: String, iface_out: String },

    #[error("counters of {iface_a} <-> {iface_b} overflow when summed")]
    CounterOverflow { iface_a: String, iface_b: String },
}

/// Traffic counters for one interface pair
///
/// `rx` comes from the `iface_a -> iface_b` rule, `tx` from its reverse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TetherStats {
    pub iface_a: String,
    pub iface_b: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

impl TetherStats {
    /// The same counters seen from the other end of the pair
    pub fn reversed(&self) -> Self {
        Self {
            iface_a: self.iface_b.clone(),
            iface_b: self.iface_a.clone(),
            rx_bytes: self.tx_bytes,
            rx_packets: self.tx_packets,
            tx_bytes: self.rx_bytes,
            tx_packets: self.rx_packets,
        }
    }

    fn same_pair(&self, other: &TetherStats) -> Option<bool> {
        if self.iface_a == other.iface_a && self.iface_b == other.iface_b {
            Some(false)
        } else if self.iface_a == other.iface_b && self.iface_b == other.iface_a {
            Some(true)
        } else {
            None
        }
    }

    /// Sum `other` into `self`; on overflow `self` is left unchanged
    fn checked_add(&mut self, other: &TetherStats) -> Result<(), DumpError> {
        let sums = (
            self.rx_bytes.checked_add(other.rx_bytes),
            self.rx_packets.checked_add(other.rx_packets),
            self.tx_bytes.checked_add(other.tx_bytes),
            self.tx_packets.checked_add(other.tx_packets),
        );
        let (Some(rx_bytes), Some(rx_packets), Some(tx_bytes), Some(tx_packets)) = sums else {
            return Err(DumpError::CounterOverflow {
                iface_a: self.iface_a.clone(),
                iface_b: self.iface_b.clone(),
            });
        };

        self.rx_bytes = rx_bytes;
        self.rx_packets = rx_packets;
        self.tx_bytes = tx_bytes;
        self.tx_packets = tx_packets;
        Ok(())
    }
}

impl fmt::Display for TetherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.iface_a,
            self.iface_b,
            self.rx_bytes,
            self.rx_packets,
            self.tx_bytes,
            self.tx_packets
        )
    }
}

fn has_header(lines: &[&str]) -> bool {
    lines.len() >= 2 && lines[0].starts_with("Chain ") && lines[1].contains("pkts")
}

fn parse_row(line: &str) -> Result<CounterRow, DumpError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < MIN_ROW_FIELDS {
        return Err(DumpError::MalformedRow(line.to_string()));
    }

    let number = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| DumpError::MalformedRow(line.to_string()))
    };

    Ok(CounterRow {
        packets: number(fields[0])?,
        bytes: number(fields[1])?,
        iface_in: fields[fields.len() - IN_FROM_END].to_string(),
        iface_out: fields[fields.len() - OUT_FROM_END].to_string(),
    })
}

/// Parse the data rows of one family's dump, skipping the two header lines
pub fn parse_counters(dump: &str) -> Result<Vec<CounterRow>, DumpError> {
    let lines: Vec<&str> = dump.lines().collect();
    if !has_header(&lines) {
        return Err(DumpError::HeaderMissing);
    }

    lines[2..]
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_row(line))
        .collect()
}

/// Match every row with its reverse-direction twin
///
/// Pairs come out in the order their first row appeared.
pub fn pair_rows(rows: Vec<CounterRow>) -> Result<Vec<TetherStats>, DumpError> {
    if rows.len() % 2 != 0 {
        return Err(DumpError::OddRowCount(rows.len()));
    }

    let mut pending: Vec<(usize, CounterRow)> = Vec::new();
    let mut paired: Vec<(usize, TetherStats)> = Vec::new();

    for (index, row) in rows.into_iter().enumerate() {
        let twin = pending
            .iter()
            .position(|(_, p)| p.iface_in == row.iface_out && p.iface_out == row.iface_in);
        match twin {
            Some(pos) => {
                let (first_index, first) = pending.remove(pos);
                paired.push((
                    first_index,
                    TetherStats {
                        iface_a: first.iface_in,
                        iface_b: first.iface_out,
                        rx_bytes: first.bytes,
                        rx_packets: first.packets,
                        tx_bytes: row.bytes,
                        tx_packets: row.packets,
                    },
                ));
            }
            None => pending.push((index, row)),
        }
    }

    if let Some((_, row)) = pending.into_iter().next() {
        return Err(DumpError::Unpaired {
            iface_in: row.iface_in,
            iface_out: row.iface_out,
        });
    }

    paired.sort_by_key(|(index, _)| *index);
    Ok(paired.into_iter().map(|(_, stats)| stats).collect())
}

/// Parse and pair one family's dump
pub fn parse_family(dump: &str) -> Result<Vec<TetherStats>, DumpError> {
    pair_rows(parse_counters(dump)?)
}

/// Sums counters of the same unordered pair across address families
#[derive(Debug, Default)]
pub struct Aggregator {
    records: Vec<TetherStats>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stats: &TetherStats) -> Result<(), DumpError> {
        for record in self.records.iter_mut() {
            match record.same_pair(stats) {
                Some(false) => return record.checked_add(stats),
                Some(true) => return record.checked_add(&stats.reversed()),
                None => {}
            }
        }
        self.records.push(stats.clone());
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Aggregated records in first-seen order
    pub fn records(&self) -> &[TetherStats] {
        &self.records
    }
}
