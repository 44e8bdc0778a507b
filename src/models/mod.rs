use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Trading bar ───────────────────────────────────────────────────────────────

/// One decoded daily bar. Dates are ascending and unique per symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradingBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub amount: f64,
    pub volume: i64,
}

// ── GBBQ reference rows ───────────────────────────────────────────────────────

/// Raw share-capital-change row (GBBQ). Field meaning depends on `category`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorporateActionEvent {
    pub category: i32,
    pub symbol: String,
    pub date: NaiveDate,
    pub c1: f64,
    pub c2: f64,
    pub c3: f64,
    pub c4: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// 除权除息: dividend, bonus shares, rights issue
    ExRights,
    /// Float/total share count snapshot
    Capital,
    Other,
}

impl CorporateActionEvent {
    pub fn kind(&self) -> ActionKind {
        match self.category {
            1 => ActionKind::ExRights,
            2 | 3 | 5 | 7 | 8 | 9 | 10 => ActionKind::Capital,
            _ => ActionKind::Other,
        }
    }
}

/// Ex-rights fields of a category-1 event, all per 10 shares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExRightsEvent {
    pub date: NaiveDate,
    pub fenhong: f64,
    pub peigu: f64,
    pub peigujia: f64,
    pub songzhuangu: f64,
}

/// Share counts after a capital change, in 万股 (10k shares).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapitalEvent {
    pub date: NaiveDate,
    pub float_shares: f64,
    pub total_shares: f64,
}

impl From<&CorporateActionEvent> for ExRightsEvent {
    fn from(e: &CorporateActionEvent) -> Self {
        Self {
            date: e.date,
            fenhong: e.c1,
            peigu: e.c2,
            peigujia: e.c3,
            songzhuangu: e.c4,
        }
    }
}

impl From<&CorporateActionEvent> for CapitalEvent {
    fn from(e: &CorporateActionEvent) -> Self {
        Self {
            date: e.date,
            float_shares: e.c3,
            total_shares: e.c4,
        }
    }
}

// ── Carry-forward state ───────────────────────────────────────────────────────

/// Seed for resuming the basic-metrics computation after `as_of`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IncrementState {
    pub prev_close: f64,
    pub last_post_float_shares: f64,
    pub last_post_total_shares: f64,
    /// Date of the persisted record this seed was rebuilt from.
    pub as_of: NaiveDate,
}

/// Seed for resuming the factor computation after `as_of`.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorSeed {
    pub last_hfq: f64,
    pub prev_close: f64,
    pub as_of: NaiveDate,
    /// Basic-metrics rows dated after `as_of`, ascending.
    pub pending: Vec<BasicMetricsRecord>,
}

// ── Derived rows ──────────────────────────────────────────────────────────────

/// Field order matches the `raw_basic` table columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasicMetricsRecord {
    pub date: NaiveDate,
    pub symbol: String,
    pub close: f64,
    pub pre_close: f64,
    pub change_percent: f64,
    pub amplitude: f64,
    pub turnover: f64,
    pub float_mv: f64,
    pub total_mv: f64,
}

/// Field order matches the `raw_adjust_factor` table columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactorRecord {
    pub date: NaiveDate,
    pub symbol: String,
    pub qfq_factor: f64,
    pub hfq_factor: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(category: i32) -> CorporateActionEvent {
        CorporateActionEvent {
            category,
            symbol: "sz000001".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 14).unwrap(),
            c1: 1.0,
            c2: 2.0,
            c3: 3.0,
            c4: 4.0,
        }
    }

    #[test]
    fn test_action_kind() {
        assert_eq!(event(1).kind(), ActionKind::ExRights);
        for cat in [2, 3, 5, 7, 8, 9, 10] {
            assert_eq!(event(cat).kind(), ActionKind::Capital);
        }
        assert_eq!(event(4).kind(), ActionKind::Other);
        assert_eq!(event(6).kind(), ActionKind::Other);
    }

    #[test]
    fn test_field_mapping() {
        let ex = ExRightsEvent::from(&event(1));
        assert_eq!((ex.fenhong, ex.peigu, ex.peigujia, ex.songzhuangu), (1.0, 2.0, 3.0, 4.0));

        let cap = CapitalEvent::from(&event(2));
        assert_eq!((cap.float_shares, cap.total_shares), (3.0, 4.0));
    }
}
