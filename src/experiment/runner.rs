//! Parameter-sweep experiment runner.
//!
//! Expands the configured grid, fans `(symbol, combination)` tasks out over
//! a bounded worker pool, and streams per-run records to disk as they
//! complete. Timeouts, transient-error retries, fail-fast, early stopping,
//! and checkpoint/resume all live here; the actual backtest is injected as
//! a closure so the runner stays agnostic of how data and strategies are
//! wired together.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use garde::Validate;
use indicatif::{ProgressBar, ProgressStyle};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::checkpoint::{Checkpoint, ResultsWriter};
use super::grid::{expand, GridSpec, SearchMode};
use crate::engine::types::PerformanceMetrics;
use crate::error::{ConfigError, DataError, Error, ExchangeError};
use crate::market::symbol::Symbol;
use crate::market::timeframe::Timeframe;
use crate::strategy::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizeDirection {
    Maximize,
    Minimize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExperimentConfig {
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(length(min = 1))]
    pub strategy_id: String,
    #[garde(length(min = 1))]
    pub symbols: Vec<Symbol>,
    #[garde(skip)]
    pub timeframe: Timeframe,
    #[garde(skip)]
    pub start: Option<chrono::DateTime<chrono::Utc>>,
    #[garde(skip)]
    pub end: Option<chrono::DateTime<chrono::Utc>>,
    /// Fixed parameters applied under every grid combination.
    #[garde(skip)]
    pub base_params: Params,
    #[garde(skip)]
    pub param_grid: BTreeMap<String, GridSpec>,
    #[garde(skip)]
    pub search: SearchMode,
    #[garde(length(min = 1))]
    pub optimization_metric: String,
    #[garde(skip)]
    pub direction: OptimizeDirection,
    #[garde(range(min = 1))]
    pub max_combinations: usize,
    #[garde(range(min = 1, max = 256))]
    pub parallel_workers: usize,
    #[garde(range(min = 0.1))]
    pub timeout_per_run_secs: f64,
    #[garde(skip)]
    pub fail_fast: bool,
    #[garde(skip)]
    pub seed: u64,
    /// Stop (random/bayesian search) after this many completions without a
    /// new best.
    #[garde(skip)]
    pub patience: Option<usize>,
    #[garde(range(min = 1))]
    pub checkpoint_every: usize,
    /// Where `runs.jsonl` and `checkpoint.json` live; `None` disables
    /// persistence.
    #[garde(skip)]
    pub output_dir: Option<PathBuf>,
}

impl ExperimentConfig {
    pub fn new(name: &str, strategy_id: &str, symbols: Vec<Symbol>, timeframe: Timeframe) -> Self {
        Self {
            name: name.to_string(),
            strategy_id: strategy_id.to_string(),
            symbols,
            timeframe,
            start: None,
            end: None,
            base_params: Params::new(),
            param_grid: BTreeMap::new(),
            search: SearchMode::Grid,
            optimization_metric: "sharpe_ratio".to_string(),
            direction: OptimizeDirection::Maximize,
            max_combinations: 200,
            parallel_workers: 4,
            timeout_per_run_secs: 300.0,
            fail_fast: false,
            seed: 0,
            patience: None,
            checkpoint_every: 10,
            output_dir: None,
        }
    }

    fn checkpoint_path(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(&self.name).join("checkpoint.json"))
    }

    fn results_path(&self) -> Option<PathBuf> {
        self.output_dir
            .as_ref()
            .map(|dir| dir.join(&self.name).join("runs.jsonl"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One `(symbol, parameter-combination)` unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRun {
    pub task_id: String,
    pub symbol: Symbol,
    pub params: Params,
    pub status: RunStatus,
    /// Flattened numeric metrics; NaN metrics are absent.
    pub metrics: Option<BTreeMap<String, f64>>,
    pub error: Option<String>,
    pub elapsed_seconds: f64,
}

/// Inputs handed to the injected backtest closure.
#[derive(Debug, Clone)]
pub struct RunTask {
    pub task_id: String,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub range: Option<(chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)>,
    pub params: Params,
    pub strategy_id: String,
}

/// The injected backtest. Runs on a blocking thread; must be deterministic
/// for a given task.
pub type BacktestFn =
    Arc<dyn Fn(&RunTask) -> Result<BTreeMap<String, f64>, anyhow::Error> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub config: ExperimentConfig,
    pub runs: Vec<ExperimentRun>,
    pub best: Option<ExperimentRun>,
    pub completed: usize,
    pub failed: usize,
    /// Tasks skipped because a checkpoint already covered them, plus tasks
    /// cancelled before starting.
    pub skipped: usize,
}

/// Flatten a metrics bundle into the name→value map recorded per run.
/// Non-finite values are dropped (NaN is the documented "no value").
pub fn metric_map(metrics: &PerformanceMetrics) -> BTreeMap<String, f64> {
    let value = serde_json::to_value(metrics).unwrap_or_default();
    let mut map = BTreeMap::new();
    if let serde_json::Value::Object(fields) = value {
        for (name, v) in fields {
            if let Some(number) = v.as_f64() {
                map.insert(name, number);
            }
        }
    }
    map
}

fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(e) = err.downcast_ref::<Error>() {
        return e.is_transient();
    }
    if let Some(e) = err.downcast_ref::<DataError>() {
        return e.is_transient();
    }
    if let Some(e) = err.downcast_ref::<ExchangeError>() {
        return e.is_transient();
    }
    false
}

enum Outcome {
    Done(Box<ExperimentRun>),
    CancelledBeforeStart,
}

/// Run the full sweep. Resumes from the checkpoint when one exists.
pub async fn run(config: &ExperimentConfig, backtest_fn: BacktestFn) -> Result<ExperimentResult, Error> {
    run_with_cancel(config, backtest_fn, &CancellationToken::new()).await
}

/// Like [`run`], with an external cancel signal: on cancellation no new
/// tasks start, in-flight tasks finish (or time out), and a partial
/// checkpoint is written.
pub async fn run_with_cancel(
    config: &ExperimentConfig,
    backtest_fn: BacktestFn,
    cancel: &CancellationToken,
) -> Result<ExperimentResult, Error> {
    config
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    let combos = expand(
        &config.param_grid,
        config.search,
        config.max_combinations,
        config.seed,
    )?;

    // Task order is deterministic: symbols in declared order, combinations
    // in expansion order.
    let mut tasks = Vec::new();
    for symbol in &config.symbols {
        for (combo_index, combo) in combos.iter().enumerate() {
            let mut params = config.base_params.clone();
            for (name, value) in combo.iter() {
                params.set(name, value.clone());
            }
            tasks.push(RunTask {
                task_id: format!("{symbol}#{combo_index}"),
                symbol: symbol.clone(),
                timeframe: config.timeframe,
                range: match (config.start, config.end) {
                    (Some(start), Some(end)) => Some((start, end)),
                    _ => None,
                },
                params,
                strategy_id: config.strategy_id.clone(),
            });
        }
    }

    let mut checkpoint = match config.checkpoint_path() {
        Some(path) => Checkpoint::load(&path, &config.name)?,
        None => Checkpoint::new(&config.name),
    };
    let done: FxHashSet<String> = checkpoint.completed.iter().cloned().collect();
    let mut skipped = tasks.iter().filter(|t| done.contains(&t.task_id)).count();

    let mut writer = match config.results_path() {
        Some(path) => Some(ResultsWriter::open(&path)?),
        None => None,
    };

    let pending: Vec<RunTask> = tasks
        .into_iter()
        .filter(|t| !done.contains(&t.task_id))
        .collect();
    let total = pending.len() as u64;

    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("  {prefix:.bold} [{bar:30.cyan/dim}] {pos}/{len} runs  {msg}")
            .expect("valid template")
            .progress_chars("=> "),
    );
    progress.set_prefix(config.name.clone());

    let semaphore = Arc::new(Semaphore::new(config.parallel_workers));
    let (tx, mut rx) = mpsc::unbounded_channel::<Outcome>();
    let timeout = Duration::from_secs_f64(config.timeout_per_run_secs);

    for task in pending {
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();
        let cancel = cancel.clone();
        let backtest_fn = Arc::clone(&backtest_fn);
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            if cancel.is_cancelled() {
                let _ = tx.send(Outcome::CancelledBeforeStart);
                return;
            }
            let run = execute_task(backtest_fn, task, timeout).await;
            let _ = tx.send(Outcome::Done(Box::new(run)));
        });
    }
    drop(tx);

    let mut runs: Vec<ExperimentRun> = Vec::new();
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut best: Option<ExperimentRun> = None;
    let mut best_value: Option<f64> = None;
    let mut since_best = 0usize;
    let mut since_checkpoint = 0usize;

    while let Some(outcome) = rx.recv().await {
        let run = match outcome {
            Outcome::Done(run) => *run,
            Outcome::CancelledBeforeStart => {
                skipped += 1;
                progress.inc(1);
                continue;
            }
        };

        if let Some(writer) = writer.as_mut() {
            writer.append(&run)?;
        }
        progress.inc(1);

        match run.status {
            RunStatus::Completed => {
                completed += 1;
                checkpoint.completed.insert(run.task_id.clone());
                since_checkpoint += 1;

                let value = run
                    .metrics
                    .as_ref()
                    .and_then(|m| m.get(&config.optimization_metric))
                    .copied();
                // Ties break on task id so the best pick does not depend on
                // completion order across parallel workers.
                let improved = match (value, best_value) {
                    (Some(_), None) => true,
                    (Some(v), Some(b)) => {
                        let better = match config.direction {
                            OptimizeDirection::Maximize => v > b,
                            OptimizeDirection::Minimize => v < b,
                        };
                        let tie_break = v == b
                            && best
                                .as_ref()
                                .is_some_and(|current| run.task_id < current.task_id);
                        better || tie_break
                    }
                    (None, _) => false,
                };
                if improved {
                    best_value = value;
                    best = Some(run.clone());
                    since_best = 0;
                    progress.set_message(format!(
                        "best {} = {:.4}",
                        config.optimization_metric,
                        value.unwrap_or(f64::NAN)
                    ));
                } else {
                    since_best += 1;
                    if config
                        .patience
                        .is_some_and(|p| since_best >= p && config.search != SearchMode::Grid)
                    {
                        tracing::info!(
                            since_best,
                            "early stopping: no improvement within patience"
                        );
                        cancel.cancel();
                    }
                }
            }
            _ => {
                failed += 1;
                if config.fail_fast {
                    tracing::warn!(task = %run.task_id, "fail-fast: cancelling pending tasks");
                    cancel.cancel();
                }
            }
        }

        if since_checkpoint >= config.checkpoint_every {
            if let Some(path) = config.checkpoint_path() {
                checkpoint.save(&path)?;
            }
            since_checkpoint = 0;
        }

        runs.push(run);
    }

    progress.finish_and_clear();
    if let Some(path) = config.checkpoint_path() {
        checkpoint.save(&path)?;
    }

    Ok(ExperimentResult {
        config: config.clone(),
        runs,
        best,
        completed,
        failed,
        skipped,
    })
}

/// Execute one task on a blocking thread with timeout and transient-error
/// retry (up to 2 retries, exponential backoff). Deterministic failures and
/// timeouts are recorded, never retried.
async fn execute_task(backtest_fn: BacktestFn, task: RunTask, timeout: Duration) -> ExperimentRun {
    const MAX_RETRIES: u32 = 2;
    let started = std::time::Instant::now();

    let mut attempt = 0u32;
    loop {
        let f = Arc::clone(&backtest_fn);
        let task_clone = task.clone();
        let outcome = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || f(&task_clone)),
        )
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            Err(_) => {
                return failed_run(&task, elapsed, format!("timed out after {timeout:?}"));
            }
            Ok(Err(join_error)) => {
                return failed_run(&task, elapsed, format!("task panicked: {join_error}"));
            }
            Ok(Ok(Ok(metrics))) => {
                return ExperimentRun {
                    task_id: task.task_id.clone(),
                    symbol: task.symbol.clone(),
                    params: task.params.clone(),
                    status: RunStatus::Completed,
                    metrics: Some(metrics),
                    error: None,
                    elapsed_seconds: elapsed,
                };
            }
            Ok(Ok(Err(error))) => {
                if attempt < MAX_RETRIES && is_transient(&error) {
                    attempt += 1;
                    let wait = Duration::from_secs(2u64.pow(attempt));
                    tracing::warn!(
                        task = %task.task_id,
                        "transient failure, retrying in {wait:?} (attempt {attempt}/{MAX_RETRIES}): {error}"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                return failed_run(&task, elapsed, error.to_string());
            }
        }
    }
}

fn failed_run(task: &RunTask, elapsed: f64, error: String) -> ExperimentRun {
    ExperimentRun {
        task_id: task.task_id.clone(),
        symbol: task.symbol.clone(),
        params: task.params.clone(),
        status: RunStatus::Failed,
        metrics: None,
        error: Some(error),
        elapsed_seconds: elapsed,
    }
}
