//! Parameter-grid expansion.
//!
//! A grid maps parameter names to either an explicit value list, a linear
//! `{start, stop, step}` range, or a log-scale spec. Expansion modes:
//! full Cartesian product, seeded random sampling, and `bayesian`, which
//! falls back to random sampling (no optimizer dependency) with a logged
//! warning. Everything is deterministic given the seed.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::strategy::params::{ParamValue, Params};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GridSpec {
    /// Explicit candidate values.
    Values(Vec<ParamValue>),
    /// Inclusive linear range.
    Range { start: f64, stop: f64, step: f64 },
    /// Geometric spacing between two positive endpoints.
    LogRange {
        log_start: f64,
        log_stop: f64,
        count: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Grid,
    Random,
    Bayesian,
}

impl GridSpec {
    /// Materialize candidate values. Integral floats become ints so int
    /// parameter specs coerce cleanly.
    pub fn values(&self) -> Result<Vec<ParamValue>, ConfigError> {
        match self {
            GridSpec::Values(values) => {
                if values.is_empty() {
                    return Err(ConfigError::Invalid("empty grid value list".into()));
                }
                Ok(values.clone())
            }
            GridSpec::Range { start, stop, step } => {
                if *step <= 0.0 || stop < start {
                    return Err(ConfigError::Invalid(format!(
                        "bad range: start={start} stop={stop} step={step}"
                    )));
                }
                let mut values = Vec::new();
                let mut v = *start;
                // Epsilon guards accumulated float error at the stop edge.
                while v <= stop + 1e-9 {
                    values.push(numeric(v));
                    v += step;
                }
                Ok(values)
            }
            GridSpec::LogRange {
                log_start,
                log_stop,
                count,
            } => {
                if *log_start <= 0.0 || *log_stop <= 0.0 || *count < 2 {
                    return Err(ConfigError::Invalid(format!(
                        "bad log range: start={log_start} stop={log_stop} count={count}"
                    )));
                }
                let ratio = (log_stop / log_start).powf(1.0 / (*count as f64 - 1.0));
                Ok((0..*count)
                    .map(|i| numeric(log_start * ratio.powi(i as i32)))
                    .collect())
            }
        }
    }
}

fn numeric(v: f64) -> ParamValue {
    if (v.round() - v).abs() < 1e-9 {
        ParamValue::Int(v.round() as i64)
    } else {
        ParamValue::Float(v)
    }
}

/// Expand a parameter grid into concrete parameter bundles, capped at
/// `max_combinations`.
pub fn expand(
    param_grid: &BTreeMap<String, GridSpec>,
    mode: SearchMode,
    max_combinations: usize,
    seed: u64,
) -> Result<Vec<Params>, ConfigError> {
    if param_grid.is_empty() {
        return Ok(vec![Params::new()]);
    }
    let axes: Vec<(String, Vec<ParamValue>)> = param_grid
        .iter()
        .map(|(name, spec)| Ok((name.clone(), spec.values()?)))
        .collect::<Result<_, ConfigError>>()?;

    match mode {
        SearchMode::Grid => Ok(cartesian(&axes, max_combinations)),
        SearchMode::Random => Ok(random_sample(&axes, max_combinations, seed)),
        SearchMode::Bayesian => {
            tracing::warn!("bayesian search has no optimizer backend; falling back to random");
            Ok(random_sample(&axes, max_combinations, seed))
        }
    }
}

fn cartesian(axes: &[(String, Vec<ParamValue>)], cap: usize) -> Vec<Params> {
    let mut combos = vec![Params::new()];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        'outer: for combo in &combos {
            for value in values {
                next.push(combo.clone().with(name, value.clone()));
                if next.len() >= cap && *name == axes[axes.len() - 1].0 {
                    break 'outer;
                }
            }
        }
        combos = next;
    }
    combos.truncate(cap);
    combos
}

fn random_sample(axes: &[(String, Vec<ParamValue>)], count: usize, seed: u64) -> Vec<Params> {
    let mut rng = StdRng::seed_from_u64(seed);
    let space: usize = axes.iter().map(|(_, v)| v.len()).product();
    let target = count.min(space);

    let mut seen = std::collections::BTreeSet::new();
    let mut combos = Vec::with_capacity(target);
    // Bounded attempts so tiny spaces with heavy collision still terminate.
    let mut attempts = 0usize;
    while combos.len() < target && attempts < count * 50 {
        attempts += 1;
        let mut params = Params::new();
        let mut key = String::new();
        for (name, values) in axes {
            let idx = rng.random_range(0..values.len());
            key.push_str(&format!("{name}={idx};"));
            params.set(name, values[idx].clone());
        }
        if seen.insert(key) {
            combos.push(params);
        }
    }
    combos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_of(entries: &[(&str, GridSpec)]) -> BTreeMap<String, GridSpec> {
        entries
            .iter()
            .map(|(name, spec)| ((*name).to_string(), spec.clone()))
            .collect()
    }

    #[test]
    fn range_expansion_inclusive() {
        let spec = GridSpec::Range {
            start: 5.0,
            stop: 20.0,
            step: 5.0,
        };
        let values = spec.values().unwrap();
        assert_eq!(
            values,
            vec![
                ParamValue::Int(5),
                ParamValue::Int(10),
                ParamValue::Int(15),
                ParamValue::Int(20)
            ]
        );
    }

    #[test]
    fn log_range_is_geometric() {
        let spec = GridSpec::LogRange {
            log_start: 1.0,
            log_stop: 100.0,
            count: 3,
        };
        let values = spec.values().unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values[0], ParamValue::Int(1));
        assert_eq!(values[1], ParamValue::Int(10));
        assert_eq!(values[2], ParamValue::Int(100));
    }

    #[test]
    fn grid_mode_is_full_cartesian_product() {
        let grid = grid_of(&[
            (
                "fast",
                GridSpec::Values(vec![ParamValue::Int(5), ParamValue::Int(10)]),
            ),
            (
                "slow",
                GridSpec::Values(vec![ParamValue::Int(20), ParamValue::Int(30)]),
            ),
        ]);
        let combos = expand(&grid, SearchMode::Grid, 100, 0).unwrap();
        assert_eq!(combos.len(), 4);
        // BTreeMap ordering makes expansion deterministic.
        assert_eq!(combos[0].get_int("fast").unwrap(), 5);
        assert_eq!(combos[0].get_int("slow").unwrap(), 20);
        assert_eq!(combos[3].get_int("fast").unwrap(), 10);
        assert_eq!(combos[3].get_int("slow").unwrap(), 30);
    }

    #[test]
    fn hard_cap_respected() {
        let grid = grid_of(&[
            (
                "a",
                GridSpec::Range {
                    start: 1.0,
                    stop: 10.0,
                    step: 1.0,
                },
            ),
            (
                "b",
                GridSpec::Range {
                    start: 1.0,
                    stop: 10.0,
                    step: 1.0,
                },
            ),
        ]);
        let combos = expand(&grid, SearchMode::Grid, 7, 0).unwrap();
        assert_eq!(combos.len(), 7);
    }

    #[test]
    fn random_is_deterministic_given_seed() {
        let grid = grid_of(&[(
            "fast",
            GridSpec::Range {
                start: 2.0,
                stop: 50.0,
                step: 1.0,
            },
        )]);
        let a = expand(&grid, SearchMode::Random, 10, 42).unwrap();
        let b = expand(&grid, SearchMode::Random, 10, 42).unwrap();
        assert_eq!(a, b);
        let c = expand(&grid, SearchMode::Random, 10, 43).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn random_never_exceeds_search_space() {
        let grid = grid_of(&[(
            "x",
            GridSpec::Values(vec![ParamValue::Int(1), ParamValue::Int(2)]),
        )]);
        let combos = expand(&grid, SearchMode::Random, 50, 7).unwrap();
        assert_eq!(combos.len(), 2);
    }

    #[test]
    fn bayesian_falls_back_to_random() {
        let grid = grid_of(&[(
            "x",
            GridSpec::Range {
                start: 1.0,
                stop: 20.0,
                step: 1.0,
            },
        )]);
        let bayes = expand(&grid, SearchMode::Bayesian, 5, 9).unwrap();
        let random = expand(&grid, SearchMode::Random, 5, 9).unwrap();
        assert_eq!(bayes, random);
    }

    #[test]
    fn empty_grid_yields_single_empty_combo() {
        let combos = expand(&BTreeMap::new(), SearchMode::Grid, 10, 0).unwrap();
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
    }

    #[test]
    fn invalid_ranges_rejected() {
        assert!(GridSpec::Range {
            start: 10.0,
            stop: 1.0,
            step: 1.0
        }
        .values()
        .is_err());
        assert!(GridSpec::Range {
            start: 1.0,
            stop: 10.0,
            step: 0.0
        }
        .values()
        .is_err());
        assert!(GridSpec::Values(vec![]).values().is_err());
    }
}
