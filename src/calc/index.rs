//! Per-symbol lookup over the GBBQ reference table.

use crate::models::{ActionKind, CapitalEvent, CorporateActionEvent, ExRightsEvent};
use chrono::NaiveDate;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct SymbolActions {
    ex_rights: Vec<ExRightsEvent>,
    capital: Vec<CapitalEvent>,
}

/// Ex-rights events and capital snapshots grouped by symbol, each sorted by
/// date. Immutable once built; share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct CorporateActionIndex {
    by_symbol: HashMap<String, SymbolActions>,
}

impl CorporateActionIndex {
    pub fn build(events: impl IntoIterator<Item = CorporateActionEvent>) -> Self {
        let mut by_symbol: HashMap<String, SymbolActions> = HashMap::new();

        for event in events {
            match event.kind() {
                ActionKind::ExRights => by_symbol
                    .entry(event.symbol.clone())
                    .or_default()
                    .ex_rights
                    .push(ExRightsEvent::from(&event)),
                ActionKind::Capital => by_symbol
                    .entry(event.symbol.clone())
                    .or_default()
                    .capital
                    .push(CapitalEvent::from(&event)),
                ActionKind::Other => {}
            }
        }

        // stable: same-date events keep their reference-file order
        for actions in by_symbol.values_mut() {
            actions.ex_rights.sort_by_key(|e| e.date);
            actions.capital.sort_by_key(|e| e.date);
        }

        Self { by_symbol }
    }

    pub fn events_for(&self, symbol: &str) -> (&[ExRightsEvent], &[CapitalEvent]) {
        match self.by_symbol.get(symbol) {
            Some(a) => (&a.ex_rights, &a.capital),
            None => (&[], &[]),
        }
    }

    /// Events strictly after `as_of`; those on or before it are already
    /// folded into a resumed state.
    pub fn events_after(
        &self,
        symbol: &str,
        as_of: Option<NaiveDate>,
    ) -> (&[ExRightsEvent], &[CapitalEvent]) {
        let (ex, cap) = self.events_for(symbol);
        match as_of {
            None => (ex, cap),
            Some(d) => (
                &ex[ex.partition_point(|e| e.date <= d)..],
                &cap[cap.partition_point(|e| e.date <= d)..],
            ),
        }
    }

    pub fn symbol_count(&self) -> usize {
        self.by_symbol.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn ev(category: i32, symbol: &str, date: NaiveDate, c1: f64, c3: f64) -> CorporateActionEvent {
        CorporateActionEvent { category, symbol: symbol.into(), date, c1, c2: 0.0, c3, c4: 0.0 }
    }

    #[test]
    fn test_split_and_sort() {
        let index = CorporateActionIndex::build(vec![
            ev(1, "sh600000", d(2024, 6, 20), 2.0, 0.0),
            ev(2, "sh600000", d(2024, 3, 1), 0.0, 500.0),
            ev(1, "sh600000", d(2023, 6, 20), 1.0, 0.0),
            ev(6, "sh600000", d(2023, 1, 1), 0.0, 0.0),
            ev(5, "sz000001", d(2022, 1, 4), 0.0, 100.0),
        ]);

        let (ex, cap) = index.events_for("sh600000");
        assert_eq!(ex.len(), 2);
        assert_eq!(ex[0].date, d(2023, 6, 20));
        assert_eq!(ex[1].fenhong, 2.0);
        assert_eq!(cap.len(), 1);
        assert_eq!(cap[0].float_shares, 500.0);

        assert_eq!(index.symbol_count(), 2);
    }

    #[test]
    fn test_same_date_events_keep_input_order() {
        let index = CorporateActionIndex::build(vec![
            ev(3, "sh600000", d(2024, 3, 1), 0.0, 100.0),
            ev(3, "sh600000", d(2024, 3, 1), 0.0, 200.0),
        ]);
        let (_, cap) = index.events_for("sh600000");
        assert_eq!(cap[0].float_shares, 100.0);
        assert_eq!(cap[1].float_shares, 200.0);
    }

    #[test]
    fn test_absent_symbol_is_empty() {
        let index = CorporateActionIndex::build(Vec::new());
        let (ex, cap) = index.events_for("bj430047");
        assert!(ex.is_empty());
        assert!(cap.is_empty());
    }

    #[test]
    fn test_events_after() {
        let index = CorporateActionIndex::build(vec![
            ev(1, "sh600000", d(2024, 1, 10), 1.0, 0.0),
            ev(1, "sh600000", d(2024, 1, 11), 1.0, 0.0),
            ev(2, "sh600000", d(2024, 1, 12), 0.0, 100.0),
        ]);
        let (ex, cap) = index.events_after("sh600000", Some(d(2024, 1, 10)));
        assert_eq!(ex.len(), 1);
        assert_eq!(ex[0].date, d(2024, 1, 11));
        assert_eq!(cap.len(), 1);

        let (ex, cap) = index.events_after("sh600000", None);
        assert_eq!((ex.len(), cap.len()), (2, 1));
    }
}
