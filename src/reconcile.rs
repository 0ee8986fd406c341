use crate::positions::{net_positions, PositionEntry, Side};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A market order that moves a mirror toward its scaled target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrectiveOrder {
    pub instrument: String,
    pub side: Side,
    pub quantity: u64,
}

impl fmt::Display for CorrectiveOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.side, self.quantity, self.instrument)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("quantity overflow while reconciling {instrument}")]
    Overflow { instrument: String },
}

/// Minimal set of corrective orders that brings `mirror` to `primary * scale`.
///
/// One order per instrument whose mirror net differs from the target, sorted
/// by instrument code.
pub fn reconcile(
    primary: &[PositionEntry],
    mirror: &[PositionEntry],
    scale: u32,
) -> Result<Vec<CorrectiveOrder>, ReconcileError> {
    let primary_net = net_positions(primary);
    let mirror_net = net_positions(mirror);

    let mut instruments: Vec<&String> = primary_net.keys().chain(mirror_net.keys()).collect();
    instruments.sort();
    instruments.dedup();

    let mut orders = Vec::new();
    for instrument in instruments {
        let src = primary_net.get(instrument).copied().unwrap_or(0);
        let dst = mirror_net.get(instrument).copied().unwrap_or(0);

        let overflow = || ReconcileError::Overflow { instrument: instrument.clone() };
        let target = src.checked_mul(i64::from(scale)).ok_or_else(overflow)?;
        let correction = target.checked_sub(dst).ok_or_else(overflow)?;
        if correction == 0 {
            continue;
        }

        orders.push(CorrectiveOrder {
            instrument: instrument.clone(),
            side: if correction > 0 { Side::Long } else { Side::Short },
            quantity: correction.unsigned_abs(),
        });
    }
    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;

    fn long(code: &str, qty: u32) -> PositionEntry {
        PositionEntry::new(code, qty, Side::Long)
    }

    fn short(code: &str, qty: u32) -> PositionEntry {
        PositionEntry::new(code, qty, Side::Short)
    }

    /// Fills every order against the mirror and returns the resulting nets.
    fn apply(mirror: &[PositionEntry], orders: &[CorrectiveOrder]) -> AHashMap<String, i64> {
        let mut net = net_positions(mirror);
        for o in orders {
            *net.entry(o.instrument.clone()).or_insert(0) += o.side.sign() * o.quantity as i64;
        }
        net
    }

    /// Rebuilds position lines from nets, dropping flat instruments.
    fn lines(net: &AHashMap<String, i64>) -> Vec<PositionEntry> {
        net.iter()
            .filter(|(_, q)| **q != 0)
            .map(|(code, q)| {
                let side = if *q > 0 { Side::Long } else { Side::Short };
                PositionEntry::new(code.clone(), q.unsigned_abs() as u32, side)
            })
            .collect()
    }

    #[test]
    fn test_opens_scaled_position_on_empty_mirror() {
        let orders = reconcile(&[long("A", 5)], &[], 2).unwrap();
        assert_eq!(
            orders,
            vec![CorrectiveOrder { instrument: "A".into(), side: Side::Long, quantity: 10 }]
        );
    }

    #[test]
    fn test_nets_mixed_lines_before_correcting() {
        let orders = reconcile(&[long("A", 3), short("A", 1)], &[long("A", 4)], 1).unwrap();
        assert_eq!(
            orders,
            vec![CorrectiveOrder { instrument: "A".into(), side: Side::Short, quantity: 2 }]
        );
    }

    #[test]
    fn test_closes_instrument_missing_from_primary() {
        let orders = reconcile(&[], &[short("B", 3)], 1).unwrap();
        assert_eq!(
            orders,
            vec![CorrectiveOrder { instrument: "B".into(), side: Side::Long, quantity: 3 }]
        );
    }

    #[test]
    fn test_zero_scale_flattens_mirror() {
        let orders = reconcile(&[long("A", 2)], &[long("A", 1), short("C", 4)], 0).unwrap();
        let net = apply(&[long("A", 1), short("C", 4)], &orders);
        assert!(net.values().all(|q| *q == 0));
    }

    #[test]
    fn test_flip_from_long_to_short_is_one_order() {
        let orders = reconcile(&[short("A", 2)], &[long("A", 3)], 1).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Short);
        assert_eq!(orders[0].quantity, 5);
    }

    #[test]
    fn test_output_sorted_by_instrument() {
        let primary = vec![long("ZB", 1), long("ES", 1), short("CL", 1)];
        let orders = reconcile(&primary, &[long("NQ", 1)], 1).unwrap();
        let codes: Vec<&str> = orders.iter().map(|o| o.instrument.as_str()).collect();
        assert_eq!(codes, vec!["CL", "ES", "NQ", "ZB"]);
    }

    #[test]
    fn test_applied_orders_converge_to_target() {
        let cases: Vec<(Vec<PositionEntry>, Vec<PositionEntry>, u32)> = vec![
            (vec![long("A", 5)], vec![], 2),
            (vec![long("A", 3), short("A", 1)], vec![long("A", 4)], 1),
            (vec![short("A", 2), long("B", 7)], vec![long("A", 1), long("C", 9)], 3),
            (vec![], vec![long("A", 1), short("B", 2)], 5),
            (vec![long("A", 1), short("A", 1)], vec![short("A", 6)], 4),
            (vec![long("X", 10), short("Y", 10)], vec![long("X", 10), short("Y", 10)], 1),
        ];

        for (primary, mirror, scale) in cases {
            let orders = reconcile(&primary, &mirror, scale).unwrap();
            let after = apply(&mirror, &orders);
            let target = net_positions(&primary);

            for (code, q) in &after {
                let want = target.get(code).copied().unwrap_or(0) * i64::from(scale);
                assert_eq!(*q, want, "instrument {code} scale {scale}");
            }
            for code in target.keys() {
                assert!(after.contains_key(code));
            }

            // Second pass against the corrected mirror is a no-op.
            let again = reconcile(&primary, &lines(&after), scale).unwrap();
            assert!(again.is_empty(), "not idempotent: {again:?}");
        }
    }

    #[test]
    fn test_identical_books_need_nothing() {
        let book = vec![long("A", 2), short("B", 1)];
        assert!(reconcile(&book, &book, 1).unwrap().is_empty());
    }

    #[test]
    fn test_overflow_is_reported() {
        let huge: Vec<PositionEntry> = (0..3).map(|_| long("A", u32::MAX)).collect();
        assert_eq!(
            reconcile(&huge, &[], u32::MAX).unwrap_err(),
            ReconcileError::Overflow { instrument: "A".into() }
        );
    }
}
