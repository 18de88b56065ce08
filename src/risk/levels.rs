//! Support/resistance detection.
//!
//! Local extrema on highs and lows are clustered by price proximity; each
//! cluster becomes a level whose strength blends touch count, recency, and
//! bounce magnitude, with an optional uplift from volume and perpetual
//! series (open interest, funding) when those are loaded.

use serde::{Deserialize, Serialize};

use crate::market::series::Candle;
use crate::market::MarketData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelType {
    Support,
    Resistance,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SRLevel {
    pub price: f64,
    pub level_type: LevelType,
    /// Combined score in [0, 1].
    pub strength: f64,
    pub touches: usize,
    pub volume_score: f64,
    pub oi_score: f64,
    pub funding_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrConfig {
    /// Bars on each side an extremum must dominate.
    pub window: usize,
    /// Relative price distance for clustering extrema (0.002 = 0.2%).
    pub price_tolerance: f64,
    /// Cap on returned levels, strongest first.
    pub max_levels: usize,
}

impl Default for SrConfig {
    fn default() -> Self {
        Self {
            window: 5,
            price_tolerance: 0.002,
            max_levels: 10,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Extremum {
    index: usize,
    price: f64,
    volume: f64,
    is_high: bool,
}

/// Detect support/resistance levels over the loaded OHLCV, enriched by
/// perpetual series when present. Levels are returned strongest first.
pub fn detect(data: &MarketData, config: &SrConfig) -> Vec<SRLevel> {
    let candles = data.candles();
    detect_levels(candles, data, config)
}

fn detect_levels(candles: &[Candle], data: &MarketData, config: &SrConfig) -> Vec<SRLevel> {
    let n = candles.len();
    let w = config.window;
    if n < 2 * w + 1 {
        return Vec::new();
    }

    let mut extrema = Vec::new();
    for i in w..n - w {
        let high = candles[i].high;
        let low = candles[i].low;
        let is_local_max = (i - w..=i + w).all(|j| candles[j].high <= high);
        let is_local_min = (i - w..=i + w).all(|j| candles[j].low >= low);
        if is_local_max {
            extrema.push(Extremum {
                index: i,
                price: high,
                volume: candles[i].volume,
                is_high: true,
            });
        }
        if is_local_min {
            extrema.push(Extremum {
                index: i,
                price: low,
                volume: candles[i].volume,
                is_high: false,
            });
        }
    }
    if extrema.is_empty() {
        return Vec::new();
    }

    let clusters = cluster_by_price(&mut extrema, config.price_tolerance);

    let avg_volume = candles.iter().map(|c| c.volume).sum::<f64>() / n as f64;
    let mut levels: Vec<SRLevel> = clusters
        .iter()
        .map(|cluster| build_level(cluster, candles, data, avg_volume, w))
        .collect();

    levels.sort_by(|a, b| {
        b.strength
            .partial_cmp(&a.strength)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    levels.truncate(config.max_levels);
    levels
}

/// Greedy clustering over price-sorted extrema: a new extremum joins the
/// current cluster while it stays within tolerance of the cluster mean.
fn cluster_by_price(extrema: &mut [Extremum], tolerance: f64) -> Vec<Vec<Extremum>> {
    extrema.sort_by(|a, b| {
        a.price
            .partial_cmp(&b.price)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut clusters: Vec<Vec<Extremum>> = Vec::new();
    for e in extrema.iter().copied() {
        match clusters.last_mut() {
            Some(cluster) => {
                let mean =
                    cluster.iter().map(|x| x.price).sum::<f64>() / cluster.len() as f64;
                if (e.price - mean).abs() / mean <= tolerance {
                    cluster.push(e);
                } else {
                    clusters.push(vec![e]);
                }
            }
            None => clusters.push(vec![e]),
        }
    }
    clusters
}

fn build_level(
    cluster: &[Extremum],
    candles: &[Candle],
    data: &MarketData,
    avg_volume: f64,
    window: usize,
) -> SRLevel {
    let n = candles.len();
    let touches = cluster.len();
    let price = cluster.iter().map(|e| e.price).sum::<f64>() / touches as f64;

    let highs = cluster.iter().filter(|e| e.is_high).count();
    let lows = touches - highs;
    let level_type = if highs > lows {
        LevelType::Resistance
    } else if lows > highs {
        LevelType::Support
    } else {
        LevelType::Both
    };

    // Touch count saturates at 5; recency favours recently-tested levels;
    // bounce measures the average reversal off the level.
    let touch_score = (touches as f64 / 5.0).min(1.0);
    let last_touch = cluster.iter().map(|e| e.index).max().unwrap_or(0);
    let recency_score = last_touch as f64 / (n - 1).max(1) as f64;
    let bounce_score = bounce_magnitude(cluster, candles, window);

    let base = 0.4 * touch_score + 0.3 * recency_score + 0.3 * bounce_score;

    let cluster_volume = cluster.iter().map(|e| e.volume).sum::<f64>() / touches as f64;
    let volume_score = if avg_volume > 0.0 {
        (cluster_volume / (2.0 * avg_volume)).min(1.0)
    } else {
        0.0
    };
    let oi_score = oi_score_at(cluster, candles, data);
    let funding_score = funding_score_at(cluster, candles, data);

    // Volume plus perpetual context can add at most 50% on top of the base.
    let uplift = 0.5 * volume_score + 0.25 * oi_score + 0.25 * funding_score;
    let strength = (base * (1.0 + 0.5 * uplift)).min(1.0);

    SRLevel {
        price,
        level_type,
        strength,
        touches,
        volume_score,
        oi_score,
        funding_score,
    }
}

/// Mean reversal off the level within `window` bars after each touch, as a
/// fraction of the level price, saturating at 2%.
fn bounce_magnitude(cluster: &[Extremum], candles: &[Candle], window: usize) -> f64 {
    let mut total = 0.0;
    let mut counted = 0usize;
    for e in cluster {
        let end = (e.index + window).min(candles.len() - 1);
        if end <= e.index {
            continue;
        }
        let slice = &candles[e.index + 1..=end];
        let reversal = if e.is_high {
            let low = slice.iter().map(|c| c.low).fold(f64::MAX, f64::min);
            (e.price - low) / e.price
        } else {
            let high = slice.iter().map(|c| c.high).fold(f64::MIN, f64::max);
            (high - e.price) / e.price
        };
        total += reversal.max(0.0);
        counted += 1;
    }
    if counted == 0 {
        return 0.0;
    }
    ((total / counted as f64) / 0.02).min(1.0)
}

/// Open-interest deviation around the level's touches: levels formed while
/// OI spiked carry more positioning weight.
fn oi_score_at(cluster: &[Extremum], candles: &[Candle], data: &MarketData) -> f64 {
    let Some(oi) = data.open_interest() else {
        return 0.0;
    };
    if oi.len() < 3 {
        return 0.0;
    }
    let values: Vec<f64> = oi.iter().map(|p| p.value).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    let std = var.sqrt();
    if std <= 0.0 {
        return 0.0;
    }

    let mut z_sum = 0.0;
    let mut counted = 0usize;
    for e in cluster {
        let ts = candles[e.index].ts;
        let idx = oi.partition_point(|p| p.ts <= ts);
        if idx == 0 {
            continue;
        }
        let z = (oi[idx - 1].value - mean) / std;
        z_sum += z.abs();
        counted += 1;
    }
    if counted == 0 {
        return 0.0;
    }
    ((z_sum / counted as f64) / 3.0).min(1.0)
}

/// Funding extremity around the level's touches.
fn funding_score_at(cluster: &[Extremum], candles: &[Candle], data: &MarketData) -> f64 {
    let Some(funding) = data.funding() else {
        return 0.0;
    };
    if funding.is_empty() {
        return 0.0;
    }

    let mut rate_sum = 0.0;
    let mut counted = 0usize;
    for e in cluster {
        let ts = candles[e.index].ts;
        let idx = funding.partition_point(|p| p.ts <= ts);
        if idx == 0 {
            continue;
        }
        rate_sum += funding[idx - 1].rate.abs();
        counted += 1;
    }
    if counted == 0 {
        return 0.0;
    }
    // 0.1% funding per interval is already an extreme print.
    ((rate_sum / counted as f64) / 0.001).min(1.0)
}

/// Strongest support strictly below `price`.
pub fn nearest_support(price: f64, levels: &[SRLevel]) -> Option<&SRLevel> {
    levels
        .iter()
        .filter(|l| l.price < price && l.level_type != LevelType::Resistance)
        .max_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Nearest resistance strictly above `price`.
pub fn nearest_resistance(price: f64, levels: &[SRLevel]) -> Option<&SRLevel> {
    levels
        .iter()
        .filter(|l| l.price > price && l.level_type != LevelType::Support)
        .min_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::series::{Series, SeriesData, SeriesMeta};
    use crate::market::symbol::{Exchange, Symbol};
    use crate::market::timeframe::Timeframe;
    use chrono::{Duration, TimeZone, Utc};

    /// Price oscillates between ~100 (support) and ~110 (resistance).
    fn oscillating_data() -> MarketData {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut candles = Vec::new();
        for i in 0..60usize {
            // Triangle wave with period 20: bottoms near 100, tops near 110.
            let phase = i % 20;
            let base = if phase < 10 {
                100.0 + f64::from(phase as u32)
            } else {
                110.0 - f64::from((phase - 10) as u32)
            };
            candles.push(Candle {
                ts: start + Duration::hours(i as i64),
                open: base,
                high: base + 0.4,
                low: base - 0.4,
                close: base,
                volume: 100.0,
            });
        }
        let mut data = MarketData::new();
        data.insert(Series {
            meta: SeriesMeta::ohlcv(Symbol::new("BTC", "USDT"), Exchange::Binance, Timeframe::H1),
            data: SeriesData::Ohlcv(candles),
        });
        data
    }

    #[test]
    fn detects_support_and_resistance_bands() {
        let data = oscillating_data();
        let levels = detect(&data, &SrConfig::default());
        assert!(!levels.is_empty());

        let has_resistance = levels
            .iter()
            .any(|l| l.level_type != LevelType::Support && (l.price - 110.4).abs() < 1.0);
        let has_support = levels
            .iter()
            .any(|l| l.level_type != LevelType::Resistance && (l.price - 99.6).abs() < 1.0);
        assert!(has_resistance, "levels: {levels:?}");
        assert!(has_support, "levels: {levels:?}");
    }

    #[test]
    fn strength_is_bounded() {
        let data = oscillating_data();
        for level in detect(&data, &SrConfig::default()) {
            assert!((0.0..=1.0).contains(&level.strength));
            assert!(level.touches >= 1);
        }
    }

    #[test]
    fn too_short_history_yields_nothing() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = (0..5)
            .map(|i| Candle {
                ts: start + Duration::hours(i),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        let mut data = MarketData::new();
        data.insert(Series {
            meta: SeriesMeta::ohlcv(Symbol::new("BTC", "USDT"), Exchange::Binance, Timeframe::H1),
            data: SeriesData::Ohlcv(candles),
        });
        assert!(detect(&data, &SrConfig::default()).is_empty());
    }

    #[test]
    fn nearest_level_lookups() {
        let levels = vec![
            SRLevel {
                price: 95.0,
                level_type: LevelType::Support,
                strength: 0.5,
                touches: 3,
                volume_score: 0.0,
                oi_score: 0.0,
                funding_score: 0.0,
            },
            SRLevel {
                price: 98.0,
                level_type: LevelType::Support,
                strength: 0.4,
                touches: 2,
                volume_score: 0.0,
                oi_score: 0.0,
                funding_score: 0.0,
            },
            SRLevel {
                price: 105.0,
                level_type: LevelType::Resistance,
                strength: 0.6,
                touches: 4,
                volume_score: 0.0,
                oi_score: 0.0,
                funding_score: 0.0,
            },
        ];
        assert_eq!(nearest_support(100.0, &levels).unwrap().price, 98.0);
        assert_eq!(nearest_resistance(100.0, &levels).unwrap().price, 105.0);
        // A support above the price is not a candidate.
        assert!(nearest_support(94.0, &levels).is_none());
        assert!(nearest_resistance(106.0, &levels).is_none());
    }
}
