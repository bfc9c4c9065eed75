//! Gap-up scanner
//!
//! Filters a symbol universe down to breakout candidates at session open.
//! Pure function of its inputs; an empty result is not an error.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::{GapCandidate, Symbol};

/// Reference prices for one symbol of the universe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseEntry {
    pub symbol: Symbol,
    pub previous_close: f64,
    pub session_open: f64,
}

impl UniverseEntry {
    pub fn new(symbol: Symbol, previous_close: f64, session_open: f64) -> Self {
        UniverseEntry {
            symbol,
            previous_close,
            session_open,
        }
    }

    /// Gap from previous close, `None` when the reference prices are unusable
    pub fn gap_pct(&self) -> Option<f64> {
        let valid = |p: f64| p.is_finite() && p > 0.0;
        if !valid(self.previous_close) || !valid(self.session_open) {
            return None;
        }
        Some((self.session_open - self.previous_close) / self.previous_close)
    }
}

/// Return every symbol whose gap is >= `gap_up_min_pct`, largest gap first.
///
/// Equal gaps are ordered by symbol so the result is fully deterministic.
pub fn scan(universe: &[UniverseEntry], config: &ScannerConfig) -> Vec<GapCandidate> {
    let mut candidates: Vec<GapCandidate> = universe
        .iter()
        .filter_map(|entry| {
            let Some(gap_pct) = entry.gap_pct() else {
                warn!(
                    symbol = %entry.symbol,
                    previous_close = entry.previous_close,
                    session_open = entry.session_open,
                    "Skipping symbol with invalid reference prices"
                );
                return None;
            };
            debug!(symbol = %entry.symbol, gap_pct, "Gap computed");
            (gap_pct >= config.gap_up_min_pct).then(|| GapCandidate {
                symbol: entry.symbol.clone(),
                previous_close: entry.previous_close,
                session_open: entry.session_open,
                gap_pct,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        OrderedFloat(b.gap_pct)
            .cmp(&OrderedFloat(a.gap_pct))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    if let Some(limit) = config.max_candidates {
        candidates.truncate(limit);
    }

    info!(
        "Found {} candidates with gap >= {:.1}% out of {} symbols",
        candidates.len(),
        config.gap_up_min_pct * 100.0,
        universe.len()
    );

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sym: &str, prev: f64, open: f64) -> UniverseEntry {
        UniverseEntry::new(Symbol::new(sym), prev, open)
    }

    #[test]
    fn test_includes_iff_gap_meets_threshold() {
        let universe = vec![
            entry("AAA", 10.0, 10.35), // 3.5%
            entry("BBB", 10.0, 10.29), // 2.9%
            entry("CCC", 100.0, 103.0), // 3.0%, on the threshold
            entry("DDD", 10.0, 9.0),   // gap down
        ];
        let result = scan(&universe, &ScannerConfig::default());
        let symbols: Vec<&str> = result.iter().map(|c| c.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAA", "CCC"]);
    }

    #[test]
    fn test_sorted_descending_by_gap() {
        let universe = vec![
            entry("LOW", 10.0, 10.4),
            entry("HIGH", 10.0, 12.0),
            entry("MID", 10.0, 11.0),
        ];
        let result = scan(&universe, &ScannerConfig::default());
        let gaps: Vec<f64> = result.iter().map(|c| c.gap_pct).collect();
        assert!(gaps.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(result[0].symbol.as_str(), "HIGH");
    }

    #[test]
    fn test_gap_pct_formula() {
        let result = scan(&[entry("X", 10.0, 10.35)], &ScannerConfig::default());
        assert_eq!(result.len(), 1);
        assert!((result[0].gap_pct - 0.035).abs() < 1e-12);
        assert_eq!(result[0].previous_close, 10.0);
        assert_eq!(result[0].session_open, 10.35);
    }

    #[test]
    fn test_empty_inputs_yield_empty_result() {
        assert!(scan(&[], &ScannerConfig::default()).is_empty());
        let flat = vec![entry("A", 10.0, 10.0), entry("B", 10.0, 10.1)];
        assert!(scan(&flat, &ScannerConfig::default()).is_empty());
    }

    #[test]
    fn test_invalid_reference_prices_skipped() {
        let universe = vec![entry("ZERO", 0.0, 10.0), entry("OK", 10.0, 11.0)];
        let result = scan(&universe, &ScannerConfig::default());
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].symbol.as_str(), "OK");
    }

    #[test]
    fn test_max_candidates_truncates_after_sort() {
        let universe = vec![
            entry("A", 10.0, 10.5),
            entry("B", 10.0, 11.5),
            entry("C", 10.0, 11.0),
        ];
        let config = ScannerConfig {
            max_candidates: Some(2),
            ..Default::default()
        };
        let symbols: Vec<String> = scan(&universe, &config)
            .into_iter()
            .map(|c| c.symbol.to_string())
            .collect();
        assert_eq!(symbols, vec!["B", "C"]);
    }

    #[test]
    fn test_ties_ordered_by_symbol() {
        let universe = vec![entry("ZZZ", 10.0, 11.0), entry("AAA", 20.0, 22.0)];
        let result = scan(&universe, &ScannerConfig::default());
        assert_eq!(result[0].symbol.as_str(), "AAA");
        assert_eq!(result[1].symbol.as_str(), "ZZZ");
    }
}
