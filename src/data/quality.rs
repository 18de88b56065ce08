//! Per-series validation and optional repair.
//!
//! Validation produces a report of findings; a report passes iff it holds
//! no critical finding. Repair (`clean`) fixes what can be fixed without
//! inventing data: duplicates are dropped, invariant-violating rows removed,
//! outliers clipped, and single-bar gaps forward-filled. Larger gaps are
//! left alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market::series::{Candle, Series, SeriesData};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub rule: String,
    pub message: String,
    pub affected_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub findings: Vec<Finding>,
}

impl QualityReport {
    /// True iff no critical finding was recorded.
    pub fn passed(&self) -> bool {
        !self
            .findings
            .iter()
            .any(|f| f.severity == Severity::Critical)
    }

    pub fn criticals(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    pub fn summary(&self) -> String {
        self.criticals()
            .map(|f| format!("{}: {}", f.rule, f.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn push(&mut self, severity: Severity, rule: &str, message: String) {
        self.findings.push(Finding {
            severity,
            rule: rule.to_string(),
            message,
            affected_range: None,
        });
    }
}

/// Validate a series against the rules for its kind.
pub fn validate(series: &Series) -> QualityReport {
    let mut report = QualityReport::default();
    match &series.data {
        SeriesData::Ohlcv(candles) => {
            validate_ohlcv(candles, series.meta.cadence.millis(), &mut report);
        }
        SeriesData::Funding(points) => {
            let cadence = series.meta.cadence.millis();
            for w in points.windows(2) {
                let gap = w[1].ts.timestamp_millis() - w[0].ts.timestamp_millis();
                if gap > cadence {
                    report.push(
                        Severity::Warning,
                        "funding_gap",
                        format!("gap of {}ms after {}", gap, w[0].ts),
                    );
                }
            }
            for p in points {
                if !p.rate.is_finite() {
                    report.push(
                        Severity::Critical,
                        "funding_not_finite",
                        format!("non-finite rate at {}", p.ts),
                    );
                } else if p.rate.abs() > 0.01 {
                    report.push(
                        Severity::Warning,
                        "funding_extreme",
                        format!("rate {} at {} is implausibly large", p.rate, p.ts),
                    );
                }
            }
        }
        SeriesData::OpenInterest(points) => {
            let values: Vec<f64> = points.iter().map(|p| p.value).collect();
            for p in points {
                if p.value < 0.0 {
                    report.push(
                        Severity::Critical,
                        "oi_negative",
                        format!("negative open interest at {}", p.ts),
                    );
                }
            }
            let mean = crate::engine::metrics::mean(&values);
            let std = crate::engine::metrics::std_dev(&values);
            if std.is_finite() && std > 0.0 {
                for p in points {
                    let z = (p.value - mean) / std;
                    if z.abs() > 3.0 {
                        report.push(
                            Severity::Warning,
                            "oi_outlier",
                            format!("open interest z-score {z:.1} at {}", p.ts),
                        );
                    }
                }
            }
        }
        SeriesData::Basis(points) => {
            for p in points {
                if !p.value.is_finite() {
                    report.push(
                        Severity::Critical,
                        "basis_not_finite",
                        format!("non-finite basis at {}", p.ts),
                    );
                }
            }
        }
        SeriesData::Liquidations(points) => {
            // Sparse coverage is normal; only negative volumes are wrong.
            for p in points {
                if p.buy_volume < 0.0 || p.sell_volume < 0.0 {
                    report.push(
                        Severity::Critical,
                        "liquidation_negative",
                        format!("negative liquidation volume at {}", p.ts),
                    );
                }
            }
        }
        SeriesData::LongShort(points) => {
            for p in points {
                let in_range =
                    (0.0..=1.0).contains(&p.long_ratio) && (0.0..=1.0).contains(&p.short_ratio);
                if !in_range {
                    report.push(
                        Severity::Critical,
                        "ratio_out_of_range",
                        format!(
                            "long {} / short {} outside [0,1] at {}",
                            p.long_ratio, p.short_ratio, p.ts
                        ),
                    );
                }
                if p.long_ratio + p.short_ratio <= 0.0 {
                    report.push(
                        Severity::Critical,
                        "ratio_sum_not_positive",
                        format!("ratio sum not positive at {}", p.ts),
                    );
                }
            }
        }
    }
    report
}

fn validate_ohlcv(candles: &[Candle], cadence_ms: i64, report: &mut QualityReport) {
    for w in candles.windows(2) {
        if w[1].ts == w[0].ts {
            report.push(
                Severity::Critical,
                "duplicate_timestamp",
                format!("duplicate bar at {}", w[0].ts),
            );
        } else {
            let gap = w[1].ts.timestamp_millis() - w[0].ts.timestamp_millis();
            if gap > cadence_ms {
                report.push(
                    Severity::Warning,
                    "bar_gap",
                    format!("{} missing bar(s) after {}", gap / cadence_ms - 1, w[0].ts),
                );
            }
        }
    }

    for c in candles {
        let values = [c.open, c.high, c.low, c.close, c.volume];
        if values.iter().any(|v| !v.is_finite()) {
            report.push(
                Severity::Critical,
                "null_value",
                format!("non-finite value at {}", c.ts),
            );
            continue;
        }
        if c.low <= 0.0 || c.open <= 0.0 || c.high <= 0.0 || c.close <= 0.0 {
            report.push(
                Severity::Critical,
                "non_positive_price",
                format!("non-positive price at {}", c.ts),
            );
            continue;
        }
        if c.volume < 0.0 {
            report.push(
                Severity::Critical,
                "negative_volume",
                format!("negative volume at {}", c.ts),
            );
        }
        if !(c.low <= c.open && c.low <= c.close && c.high >= c.open && c.high >= c.close) {
            report.push(
                Severity::Critical,
                "ohlc_invariant",
                format!("low/high do not bound open/close at {}", c.ts),
            );
        }
        if c.volume == 0.0 {
            report.push(
                Severity::Info,
                "zero_volume",
                format!("zero-volume bar at {}", c.ts),
            );
        }
    }

    let (lower, upper) = iqr_bounds(candles);
    if upper > lower {
        for c in candles {
            if c.close < lower || c.close > upper {
                report.push(
                    Severity::Warning,
                    "price_outlier",
                    format!("close {} at {} outside IQR bounds", c.close, c.ts),
                );
            }
        }
    }
}

/// Tukey fences on closes: `[q1 - 1.5·IQR, q3 + 1.5·IQR]`.
fn iqr_bounds(candles: &[Candle]) -> (f64, f64) {
    if candles.len() < 4 {
        return (f64::NEG_INFINITY, f64::INFINITY);
    }
    let mut closes: Vec<f64> = candles
        .iter()
        .map(|c| c.close)
        .filter(|c| c.is_finite())
        .collect();
    if closes.len() < 4 {
        return (f64::NEG_INFINITY, f64::INFINITY);
    }
    closes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q1 = closes[closes.len() / 4];
    let q3 = closes[closes.len() * 3 / 4];
    let iqr = q3 - q1;
    (q1 - 1.5 * iqr, q3 + 1.5 * iqr)
}

/// Repair what can be repaired without fabricating data.
pub fn clean(series: &Series) -> Series {
    let mut out = series.clone();
    if let SeriesData::Ohlcv(candles) = &mut out.data {
        let cadence_ms = series.meta.cadence.millis();

        // Deduplicate timestamps, keeping the first occurrence.
        let mut seen = std::collections::BTreeSet::new();
        candles.retain(|c| seen.insert(c.ts.timestamp_millis()));

        // Drop rows that violate the OHLC invariants outright.
        candles.retain(|c| {
            [c.open, c.high, c.low, c.close, c.volume]
                .iter()
                .all(|v| v.is_finite())
                && c.low > 0.0
                && c.volume >= 0.0
                && c.low <= c.open
                && c.low <= c.close
                && c.high >= c.open
                && c.high >= c.close
        });

        // Clip close outliers to the IQR fences, keeping high/low consistent.
        let (lower, upper) = iqr_bounds(candles);
        if upper > lower {
            for c in candles.iter_mut() {
                if c.close < lower || c.close > upper {
                    c.close = c.close.clamp(lower, upper);
                    c.high = c.high.max(c.close);
                    c.low = c.low.min(c.close);
                }
            }
        }

        // Forward-fill exactly one missing bar; wider gaps stay gaps.
        let mut filled = Vec::with_capacity(candles.len());
        for c in candles.iter() {
            if let Some(prev) = filled.last().cloned() {
                let prev: Candle = prev;
                let gap = c.ts.timestamp_millis() - prev.ts.timestamp_millis();
                if gap == 2 * cadence_ms {
                    filled.push(Candle {
                        ts: prev.ts + chrono::Duration::milliseconds(cadence_ms),
                        open: prev.close,
                        high: prev.close,
                        low: prev.close,
                        close: prev.close,
                        volume: 0.0,
                    });
                }
            }
            filled.push(*c);
        }
        *candles = filled;
    }
    out
}
