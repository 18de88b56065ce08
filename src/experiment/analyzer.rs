//! Post-processing over experiment run records: ranking, filtering,
//! parameter importance, cross-metric correlation, and report rendering.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use nalgebra::DMatrix;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use super::runner::{ExperimentResult, ExperimentRun, OptimizeDirection, RunStatus};
use crate::risk::portfolio::correlation;
use crate::strategy::params::{ParamValue, Params};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Markdown,
    Json,
    Html,
}

/// Metric-range and parameter-equality filters.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// metric name → (min, max), either side open.
    pub metric_ranges: BTreeMap<String, (Option<f64>, Option<f64>)>,
    /// Exact parameter matches.
    pub param_equals: Params,
}

impl RunFilter {
    fn matches(&self, run: &ExperimentRun) -> bool {
        for (metric, (min, max)) in &self.metric_ranges {
            let Some(value) = run.metrics.as_ref().and_then(|m| m.get(metric)) else {
                return false;
            };
            if min.is_some_and(|m| *value < m) || max.is_some_and(|m| *value > m) {
                return false;
            }
        }
        for (name, expected) in self.param_equals.iter() {
            if run.params.get(name) != Some(expected) {
                return false;
            }
        }
        true
    }
}

fn completed(runs: &[ExperimentRun]) -> impl Iterator<Item = &ExperimentRun> {
    runs.iter().filter(|r| r.status == RunStatus::Completed)
}

fn metric_of(run: &ExperimentRun, metric: &str) -> Option<f64> {
    run.metrics
        .as_ref()
        .and_then(|m| m.get(metric))
        .copied()
        .filter(|v| v.is_finite())
}

/// Top `k` completed runs by `metric`. Ties break on task id so the order
/// is reproducible.
pub fn top<'a>(
    runs: &'a [ExperimentRun],
    k: usize,
    metric: &str,
    direction: OptimizeDirection,
) -> Vec<&'a ExperimentRun> {
    let mut ranked: Vec<&ExperimentRun> = completed(runs)
        .filter(|r| metric_of(r, metric).is_some())
        .collect();
    ranked.sort_by_key(|r| {
        let value = OrderedFloat(metric_of(r, metric).unwrap_or(f64::NAN));
        let key = match direction {
            OptimizeDirection::Maximize => -value,
            OptimizeDirection::Minimize => value,
        };
        (key, r.task_id.clone())
    });
    ranked.truncate(k);
    ranked
}

/// Completed runs matching every predicate.
pub fn filter<'a>(runs: &'a [ExperimentRun], predicate: &RunFilter) -> Vec<&'a ExperimentRun> {
    completed(runs).filter(|r| predicate.matches(r)).collect()
}

fn numeric_param(value: &ParamValue) -> Option<f64> {
    match value {
        ParamValue::Bool(b) => Some(f64::from(u8::from(*b))),
        other => other.as_float(),
    }
}

/// Normalized importance score per parameter for `metric`.
///
/// The score is the absolute Pearson correlation between the parameter's
/// value and the metric across completed runs, scaled so scores sum to one.
/// Fully deterministic for a given run set.
pub fn parameter_importance(runs: &[ExperimentRun], metric: &str) -> BTreeMap<String, f64> {
    let rows: Vec<(&Params, f64)> = completed(runs)
        .filter_map(|r| metric_of(r, metric).map(|v| (&r.params, v)))
        .collect();
    if rows.len() < 3 {
        return BTreeMap::new();
    }

    let mut names: Vec<String> = Vec::new();
    for (params, _) in &rows {
        for (name, value) in params.iter() {
            if numeric_param(value).is_some() && !names.contains(name) {
                names.push(name.clone());
            }
        }
    }

    let metric_values: Vec<f64> = rows.iter().map(|(_, v)| *v).collect();
    let mut raw: BTreeMap<String, f64> = BTreeMap::new();
    for name in names {
        let values: Vec<f64> = rows
            .iter()
            .map(|(p, _)| p.get(&name).and_then(numeric_param).unwrap_or(f64::NAN))
            .collect();
        if values.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let c = correlation(&values, &metric_values);
        if c.is_finite() {
            raw.insert(name, c.abs());
        }
    }

    let total: f64 = raw.values().sum();
    if total > 0.0 {
        for value in raw.values_mut() {
            *value /= total;
        }
    }
    raw
}

/// Pairwise correlation matrix over chosen parameters and metrics.
/// Returns the row/column labels alongside the matrix.
pub fn correlation_matrix(
    runs: &[ExperimentRun],
    params: &[&str],
    metrics: &[&str],
) -> (Vec<String>, DMatrix<f64>) {
    let rows: Vec<&ExperimentRun> = completed(runs).collect();
    let mut labels = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();

    for &name in params {
        labels.push(format!("param:{name}"));
        columns.push(
            rows.iter()
                .map(|r| r.params.get(name).and_then(numeric_param).unwrap_or(f64::NAN))
                .collect(),
        );
    }
    for &name in metrics {
        labels.push(format!("metric:{name}"));
        columns.push(
            rows.iter()
                .map(|r| metric_of(r, name).unwrap_or(f64::NAN))
                .collect(),
        );
    }

    let n = columns.len();
    let mut matrix = DMatrix::from_element(n, n, f64::NAN);
    for i in 0..n {
        matrix[(i, i)] = 1.0;
        for j in i + 1..n {
            let c = correlation(&columns[i], &columns[j]);
            matrix[(i, j)] = c;
            matrix[(j, i)] = c;
        }
    }
    (labels, matrix)
}

/// Render a human-readable summary of an experiment.
pub fn report(result: &ExperimentResult, format: ReportFormat) -> String {
    match format {
        ReportFormat::Json => report_json(result),
        ReportFormat::Markdown => report_markdown(result),
        ReportFormat::Html => {
            let body = report_markdown(result);
            format!(
                "<html><body><pre>{}</pre></body></html>",
                body.replace('<', "&lt;").replace('>', "&gt;")
            )
        }
    }
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    name: &'a str,
    strategy: &'a str,
    metric: &'a str,
    completed: usize,
    failed: usize,
    skipped: usize,
    best: Option<&'a ExperimentRun>,
    importance: BTreeMap<String, f64>,
}

fn report_json(result: &ExperimentResult) -> String {
    let summary = JsonSummary {
        name: &result.config.name,
        strategy: &result.config.strategy_id,
        metric: &result.config.optimization_metric,
        completed: result.completed,
        failed: result.failed,
        skipped: result.skipped,
        best: result.best.as_ref(),
        importance: parameter_importance(&result.runs, &result.config.optimization_metric),
    };
    serde_json::to_string_pretty(&summary).unwrap_or_else(|_| "{}".to_string())
}

fn report_markdown(result: &ExperimentResult) -> String {
    let metric = &result.config.optimization_metric;
    let mut out = String::new();
    let _ = writeln!(out, "# Experiment: {}", result.config.name);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "strategy `{}` — {} completed, {} failed, {} skipped",
        result.config.strategy_id, result.completed, result.failed, result.skipped
    );
    let _ = writeln!(out);

    if let Some(best) = &result.best {
        let value = metric_of(best, metric).unwrap_or(f64::NAN);
        let _ = writeln!(out, "**Best {metric}: {value:.4}** ({})", best.task_id);
        let _ = writeln!(out);
    }

    let ranked = top(&result.runs, 10, metric, result.config.direction);
    if !ranked.is_empty() {
        let _ = writeln!(out, "| rank | task | {metric} | params |");
        let _ = writeln!(out, "|---|---|---|---|");
        for (i, run) in ranked.iter().enumerate() {
            let value = metric_of(run, metric).unwrap_or(f64::NAN);
            let params = run
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v:?}"))
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "| {} | {} | {value:.4} | {params} |", i + 1, run.task_id);
        }
        let _ = writeln!(out);
    }

    let importance = parameter_importance(&result.runs, metric);
    if !importance.is_empty() {
        let _ = writeln!(out, "## Parameter importance");
        let _ = writeln!(out);
        for (name, score) in &importance {
            let _ = writeln!(out, "- `{name}`: {score:.3}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::symbol::Symbol;
    use crate::market::timeframe::Timeframe;

    fn make_run(id: usize, fast: i64, sharpe: f64) -> ExperimentRun {
        ExperimentRun {
            task_id: format!("BTC/USDT#{id}"),
            symbol: Symbol::new("BTC", "USDT"),
            params: Params::new().with("fast", fast).with("mode", "sma"),
            status: RunStatus::Completed,
            metrics: Some(
                [
                    ("sharpe_ratio".to_string(), sharpe),
                    ("max_drawdown".to_string(), 0.1 + fast as f64 / 100.0),
                ]
                .into_iter()
                .collect(),
            ),
            error: None,
            elapsed_seconds: 1.0,
        }
    }

    fn sample_runs() -> Vec<ExperimentRun> {
        // sharpe increases monotonically with fast.
        (0..10)
            .map(|i| make_run(i, i as i64 + 2, i as f64 * 0.2))
            .collect()
    }

    #[test]
    fn top_ranks_by_direction() {
        let runs = sample_runs();
        let best = top(&runs, 3, "sharpe_ratio", OptimizeDirection::Maximize);
        assert_eq!(best.len(), 3);
        assert_eq!(best[0].task_id, "BTC/USDT#9");
        let worst = top(&runs, 1, "sharpe_ratio", OptimizeDirection::Minimize);
        assert_eq!(worst[0].task_id, "BTC/USDT#0");
    }

    #[test]
    fn top_skips_failed_and_missing_metric_runs() {
        let mut runs = sample_runs();
        runs[4].status = RunStatus::Failed;
        runs[5].metrics = None;
        let ranked = top(&runs, 100, "sharpe_ratio", OptimizeDirection::Maximize);
        assert_eq!(ranked.len(), 8);
    }

    #[test]
    fn filter_by_metric_range_and_param() {
        let runs = sample_runs();
        let mut predicate = RunFilter::default();
        predicate
            .metric_ranges
            .insert("sharpe_ratio".to_string(), (Some(1.0), None));
        let matched = filter(&runs, &predicate);
        assert_eq!(matched.len(), 5); // sharpe ∈ {1.0, 1.2, 1.4, 1.6, 1.8}

        predicate.param_equals.set("fast", 7i64);
        let matched = filter(&runs, &predicate);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].params.get_int("fast").unwrap(), 7);
    }

    #[test]
    fn importance_finds_the_driving_parameter() {
        let runs = sample_runs();
        let importance = parameter_importance(&runs, "sharpe_ratio");
        // `fast` perfectly correlates with sharpe; `mode` is a string and
        // is not scored.
        assert!(importance.contains_key("fast"));
        assert!(!importance.contains_key("mode"));
        assert!((importance["fast"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn importance_is_deterministic() {
        let runs = sample_runs();
        assert_eq!(
            parameter_importance(&runs, "sharpe_ratio"),
            parameter_importance(&runs, "sharpe_ratio")
        );
    }

    #[test]
    fn correlation_matrix_labels_and_symmetry() {
        let runs = sample_runs();
        let (labels, matrix) =
            correlation_matrix(&runs, &["fast"], &["sharpe_ratio", "max_drawdown"]);
        assert_eq!(labels, vec!["param:fast", "metric:sharpe_ratio", "metric:max_drawdown"]);
        assert_eq!(matrix.nrows(), 3);
        // fast and sharpe are perfectly correlated in the fixture.
        assert!((matrix[(0, 1)] - 1.0).abs() < 1e-9);
        assert!((matrix[(0, 1)] - matrix[(1, 0)]).abs() < 1e-12);
    }

    #[test]
    fn reports_render_in_all_formats() {
        use crate::experiment::runner::{ExperimentConfig, ExperimentResult};
        let runs = sample_runs();
        let best = runs.last().cloned();
        let result = ExperimentResult {
            config: ExperimentConfig::new(
                "report-test",
                "sma_cross",
                vec![Symbol::new("BTC", "USDT")],
                Timeframe::H1,
            ),
            runs,
            best,
            completed: 10,
            failed: 0,
            skipped: 0,
        };

        let markdown = report(&result, ReportFormat::Markdown);
        assert!(markdown.contains("# Experiment: report-test"));
        assert!(markdown.contains("Best sharpe_ratio"));
        assert!(markdown.contains("| rank |"));

        let json = report(&result, ReportFormat::Json);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["completed"], 10);
        assert_eq!(parsed["name"], "report-test");

        let html = report(&result, ReportFormat::Html);
        assert!(html.starts_with("<html>"));
    }
}
