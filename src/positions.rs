use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    #[inline]
    pub fn sign(self) -> i64 {
        match self { Side::Long => 1, Side::Short => -1 }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Which configured account a piece of state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Primary,
    Mirror1,
    Mirror2,
}

impl AccountRole {
    pub const MIRRORS: [AccountRole; 2] = [AccountRole::Mirror1, AccountRole::Mirror2];
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountRole::Primary => write!(f, "primary"),
            AccountRole::Mirror1 => write!(f, "mirror1"),
            AccountRole::Mirror2 => write!(f, "mirror2"),
        }
    }
}

/// One open position line as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionEntry {
    pub instrument: String,
    pub quantity: u32,
    pub side: Side,
}

impl PositionEntry {
    pub fn new(instrument: impl Into<String>, quantity: u32, side: Side) -> Self {
        Self { instrument: instrument.into(), quantity, side }
    }

    #[inline]
    pub fn signed_quantity(&self) -> i64 {
        self.side.sign() * i64::from(self.quantity)
    }
}

/// Net signed quantity per instrument (long minus short).
///
/// Instruments that appear in the list are always present in the map, even
/// when their lines cancel out to zero.
pub fn net_positions(entries: &[PositionEntry]) -> AHashMap<String, i64> {
    let mut net: AHashMap<String, i64> = AHashMap::new();
    for p in entries {
        *net.entry(p.instrument.clone()).or_insert(0) += p.signed_quantity();
    }
    net
}

/// Order-independent equality of two position lists.
pub fn same_positions(a: &[PositionEntry], b: &[PositionEntry]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a_sorted: Vec<&PositionEntry> = a.iter().collect();
    let mut b_sorted: Vec<&PositionEntry> = b.iter().collect();
    a_sorted.sort_by(|x, y| (&x.instrument, x.side, x.quantity).cmp(&(&y.instrument, y.side, y.quantity)));
    b_sorted.sort_by(|x, y| (&x.instrument, x.side, x.quantity).cmp(&(&y.instrument, y.side, y.quantity)));
    a_sorted == b_sorted
}

/// Latest and previous position lists of one account.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    current: Vec<PositionEntry>,
    previous: Vec<PositionEntry>,
}

impl Snapshot {
    pub fn current(&self) -> &[PositionEntry] {
        &self.current
    }

    /// Replace the current list wholesale with a fresh read.
    pub fn replace(&mut self, fresh: Vec<PositionEntry>) {
        self.current = fresh;
    }

    pub fn changed(&self) -> bool {
        !same_positions(&self.current, &self.previous)
    }

    /// previous <- current
    pub fn rotate(&mut self) {
        self.previous = self.current.clone();
    }
}
