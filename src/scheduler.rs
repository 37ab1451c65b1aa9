// src/scheduler.rs
//! One cycle: discover → ledger filter → Stage 1 → Stage 2 → (dry run stops here)
//! → reserve budget → dispatch → ledger record, in discovery order.
//!
//! The daemon loop repeats cycles at the configured interval. A failed cycle is
//! logged and the next one still runs.

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::budget::{today_utc, BudgetGuard};
use crate::config::{AppConfig, ConfigBundle, KeywordConfig};
use crate::dispatch::{CommandRunner, Dispatcher, PipelineRunner};
use crate::ingest::collect_candidates;
use crate::ingest::providers::build_sources;
use crate::ingest::types::FeedSource;
use crate::ledger::{DispatchStatus, Ledger, LedgerError, ProcessedRecord};
use crate::relevance::metadata::{MetadataLookup, YtDlpLookup};
use crate::relevance::stage1::Stage1Policy;
use crate::relevance::{run_stage1, run_stage2, GateStats};

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("cycle_runs_total", "Cycles started.");
        describe_counter!("cycle_failures_total", "Cycles aborted by a cycle-level error.");
        describe_counter!("feed_errors_total", "Per-source feed fetch/parse failures.");
        describe_counter!("feed_entries_total", "Entries parsed from feeds.");
        describe_histogram!("feed_parse_ms", "Feed parse time in milliseconds.");
        describe_counter!("stage1_pass_total", "Items that passed the keyword filter.");
        describe_counter!("stage2_pass_total", "Items that met the Stage 2 threshold.");
        describe_counter!("metadata_errors_total", "Failed metadata lookups.");
        describe_counter!("dispatch_total", "Dispatch attempts by outcome status.");
        describe_counter!("budget_trips_total", "Cycles stopped by the daily budget.");
        describe_gauge!("budget_spent_usd", "Spend reserved for the current UTC day.");
        describe_gauge!("cycle_last_run_ts", "Unix ts when the last cycle finished.");
    });
}

/// Resolves once the shutdown flag turns true (or the sender is gone).
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDispatch {
    pub id: String,
    pub title: String,
    pub url: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub dry_run: bool,
    pub fetched: usize,
    pub new: usize,
    pub stage1_passed: usize,
    pub deferred: usize,
    pub metadata_errors: usize,
    pub stage2_passed: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// Qualifying items left for a later cycle because the budget ran out.
    pub budget_skipped: usize,
    pub budget_tripped: bool,
    /// A stop signal arrived between dispatches.
    pub interrupted: bool,
    /// Dry run only: what a real cycle would have dispatched, in order.
    pub would_dispatch: Vec<PlannedDispatch>,
}

/// External collaborators a scheduler drives.
pub struct Collaborators {
    pub sources: Vec<Box<dyn FeedSource>>,
    pub metadata: Arc<dyn MetadataLookup>,
    pub runner: Arc<dyn PipelineRunner>,
    pub ledger: Arc<Ledger>,
    pub budget: Arc<BudgetGuard>,
}

pub struct Scheduler {
    app: AppConfig,
    keywords: KeywordConfig,
    sources: Vec<Box<dyn FeedSource>>,
    metadata: Arc<dyn MetadataLookup>,
    dispatcher: Dispatcher,
    ledger: Arc<Ledger>,
    budget: Arc<BudgetGuard>,
}

impl Scheduler {
    pub fn new(app: AppConfig, keywords: KeywordConfig, c: Collaborators) -> Self {
        let dispatcher = Dispatcher::new(c.runner, Duration::from_secs(app.dispatch.timeout_secs));
        Self {
            app,
            keywords,
            sources: c.sources,
            metadata: c.metadata,
            dispatcher,
            ledger: c.ledger,
            budget: c.budget,
        }
    }

    /// Production wiring: HTTP feeds, `yt-dlp`, the configured pipeline command,
    /// and file-backed ledger / budget under `state.dir`.
    pub fn from_config(bundle: &ConfigBundle) -> Result<Self> {
        let app = &bundle.app;
        let ledger = Ledger::open(app.state.ledger_path()).context("opening ledger")?;
        let budget = BudgetGuard::open(app.state.budget_path(), app.budget.daily_limit_usd)
            .context("opening budget record")?;
        let collaborators = Collaborators {
            sources: build_sources(
                &bundle.sources,
                Duration::from_secs(app.polling.feed_timeout_secs),
            ),
            metadata: Arc::new(YtDlpLookup::new(
                app.metadata.command.clone(),
                Duration::from_secs(app.metadata.timeout_secs),
            )),
            runner: Arc::new(CommandRunner::from_config(&app.dispatch, app.budget.per_item_usd)),
            ledger: Arc::new(ledger),
            budget: Arc::new(budget),
        };
        Ok(Self::new(app.clone(), bundle.keywords.clone(), collaborators))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.app.polling.interval_secs)
    }

    /// Run one cycle. Per-item failures are absorbed; discovery, budget-store or
    /// ledger-store failures abort the cycle with an error.
    pub async fn run_cycle(
        &self,
        dry_run: bool,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<CycleReport> {
        ensure_metrics_described();
        counter!("cycle_runs_total").increment(1);
        let mut report = CycleReport {
            dry_run,
            ..Default::default()
        };
        tracing::info!(target: "cycle", dry_run, sources = self.sources.len(), "cycle start");

        let (candidates, discovery) = collect_candidates(
            &self.sources,
            &self.ledger,
            Utc::now(),
            self.app.polling.max_age_days,
        )
        .await
        .context("discovery")?;
        report.fetched = discovery.fetched;
        report.new = candidates.len();
        tracing::info!(
            target: "cycle",
            fetched = discovery.fetched,
            new = candidates.len(),
            already_processed = discovery.already_processed,
            too_old = discovery.too_old,
            sources_failed = discovery.sources_failed,
            "discovery done"
        );

        let mut gate = GateStats::default();
        let policy = Stage1Policy {
            min_score: self.app.thresholds.stage1_min_score,
            high_weight: self.app.thresholds.stage1_high_weight,
        };
        let survivors = run_stage1(
            candidates,
            &self.keywords,
            policy,
            self.app.polling.max_items_per_poll,
            &mut gate,
        );
        let qualifying = run_stage2(
            survivors,
            self.metadata.as_ref(),
            &self.keywords,
            &self.app.scoring,
            self.app.thresholds.stage2_min_score,
            &mut gate,
        )
        .await;
        report.stage1_passed = gate.stage1_passed;
        report.deferred = gate.deferred;
        report.metadata_errors = gate.metadata_errors;
        report.stage2_passed = gate.stage2_passed;
        tracing::info!(
            target: "cycle",
            stage1 = gate.stage1_passed,
            deferred = gate.deferred,
            metadata_errors = gate.metadata_errors,
            stage2 = gate.stage2_passed,
            "relevance gate done"
        );

        if dry_run {
            for q in &qualifying {
                tracing::info!(
                    target: "cycle",
                    id = %q.item.id,
                    score = q.score,
                    title = %q.item.title,
                    "would dispatch"
                );
                report.would_dispatch.push(PlannedDispatch {
                    id: q.item.id.clone(),
                    title: q.item.title.clone(),
                    url: q.item.url.clone(),
                    score: q.score,
                });
            }
            self.finish(&report);
            return Ok(report);
        }

        let per_item = self.app.budget.per_item_usd;
        let total = qualifying.len();
        for (idx, q) in qualifying.into_iter().enumerate() {
            if *shutdown.borrow() {
                tracing::info!(
                    target: "cycle",
                    remaining = total - idx,
                    "shutdown requested; no further dispatches"
                );
                report.interrupted = true;
                break;
            }

            let reserved = self.budget.try_reserve(per_item).context("budget reservation")?;
            if !reserved {
                report.budget_tripped = true;
                report.budget_skipped = total - idx;
                counter!("budget_trips_total").increment(1);
                let remaining = self.budget.remaining_budget(today_utc()).unwrap_or(0.0);
                tracing::warn!(
                    target: "cycle",
                    id = %q.item.id,
                    per_item_usd = per_item,
                    remaining_usd = remaining,
                    skipped = report.budget_skipped,
                    "daily budget exhausted; skipping remaining dispatches this cycle"
                );
                break;
            }

            tracing::info!(
                target: "cycle",
                id = %q.item.id,
                score = q.score,
                title = %q.item.title,
                "dispatching"
            );
            let outcome = self.dispatcher.dispatch(&q.item, q.score).await;
            report.dispatched += 1;
            match outcome.status {
                DispatchStatus::Completed => {
                    report.completed += 1;
                    tracing::info!(
                        target: "cycle",
                        id = %q.item.id,
                        elapsed_ms = outcome.exit.elapsed.as_millis() as u64,
                        "dispatch completed"
                    );
                }
                DispatchStatus::Failed => {
                    report.failed += 1;
                    tracing::warn!(
                        target: "cycle",
                        id = %q.item.id,
                        exit_code = ?outcome.exit.code,
                        timed_out = outcome.exit.timed_out,
                        stderr = %outcome.exit.stderr_tail,
                        "dispatch failed; item will not be retried"
                    );
                }
            }

            let record = ProcessedRecord {
                item_id: q.item.id.clone(),
                title: q.item.title.clone(),
                url: q.item.url.clone(),
                source_name: q.item.source_name.clone(),
                score: q.score,
                status: outcome.status,
                dispatched_at: Utc::now(),
                exit_code: outcome.exit.code,
                timed_out: outcome.exit.timed_out,
                cost_usd: per_item,
            };
            match self.ledger.mark_processed(record) {
                Ok(()) => {}
                Err(LedgerError::Duplicate(id)) => {
                    tracing::warn!(
                        target: "cycle",
                        id = %id,
                        "ledger already had a record; kept the first"
                    );
                }
                Err(e) => return Err(e).context("writing ledger record"),
            }
        }

        self.finish(&report);
        Ok(report)
    }

    fn finish(&self, report: &CycleReport) {
        gauge!("cycle_last_run_ts").set(Utc::now().timestamp() as f64);
        let today = today_utc();
        if let Ok(spent) = self.budget.current_spend(today) {
            gauge!("budget_spent_usd").set(spent);
        }
        if let Ok(summary) = self.budget.summary(today) {
            tracing::info!(target: "cycle", budget = %summary, "budget");
        }
        tracing::info!(
            target: "cycle",
            dry_run = report.dry_run,
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            budget_skipped = report.budget_skipped,
            would_dispatch = report.would_dispatch.len(),
            "cycle end"
        );
    }
}

/// Run one cycle and log a failure instead of returning it. Ledger storage
/// failures are the exception and are returned: a record that never reached disk
/// would let the next cycle's fresh ledger dispatch the item again.
async fn run_logged(s: &Scheduler, dry_run: bool, shutdown: &watch::Receiver<bool>) -> Result<()> {
    let Err(e) = s.run_cycle(dry_run, shutdown).await else {
        return Ok(());
    };
    counter!("cycle_failures_total").increment(1);
    if matches!(
        e.downcast_ref::<LedgerError>(),
        Some(LedgerError::Io { .. } | LedgerError::Poisoned)
    ) {
        tracing::error!(target: "cycle", error = ?e, "ledger storage failed; stopping");
        return Err(e);
    }
    tracing::error!(
        target: "cycle",
        error = ?e,
        "cycle failed; nothing dispatched after the failure point"
    );
    Ok(())
}

/// Continuous mode. `next` builds a fresh scheduler for each cycle (re-reading
/// configuration); a build failure skips that cycle. Between cycles the loop
/// sleeps the scheduler's interval, or `fallback_interval` if none was built.
/// Returns when shutdown is signalled, or with an error when the ledger can no
/// longer be written.
pub async fn run_loop<F>(
    mut next: F,
    dry_run: bool,
    fallback_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    F: FnMut() -> Result<Scheduler> + Send,
{
    let mut interval = fallback_interval;
    loop {
        match next() {
            Ok(s) => {
                interval = s.interval();
                run_logged(&s, dry_run, &shutdown).await?;
            }
            Err(e) => {
                counter!("cycle_failures_total").increment(1);
                tracing::error!(
                    target: "cycle",
                    error = ?e,
                    "configuration reload failed; cycle skipped"
                );
            }
        }

        if *shutdown.borrow() {
            break;
        }
        tracing::debug!(target: "cycle", secs = interval.as_secs(), "sleeping until next cycle");
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
    tracing::info!(target: "cycle", "daemon stopped");
    Ok(())
}
