//! Cycle runner: selects due sources, replays or (re-)analyzes them on a
//! bounded pool, applies outcomes through the lifecycle and persists them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analyzer::PageAnalyzer;
use crate::error::AppError;
use crate::lifecycle::{Lifecycle, Outcome, ReanalysisPolicy, SourceStatus, reconcile};
use crate::models::{NewSource, Source};
use crate::replay::ReplayEngine;
use crate::router::{ExtractorRef, Route, classify, extract_domain};
use crate::traits::{Cleaner, Fetcher, RecipeGenerator, SourceStore};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum sources processed at once.
    pub concurrency: usize,
    /// Pause between cycles in [`SchedulerService::run`].
    pub interval: Duration,
    pub policy: ReanalysisPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            interval: Duration::from_secs(24 * 60 * 60),
            policy: ReanalysisPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_policy(mut self, policy: ReanalysisPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// What a unit of work does to one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// First analysis of a pending source.
    Analyze,
    /// Automatic re-analysis of a stale source.
    Reanalyze,
    /// Operator-requested analysis of a failed source.
    Retry,
    Replay,
}

impl Action {
    fn entry_outcome(self) -> Option<Outcome> {
        match self {
            Action::Analyze => Some(Outcome::Created),
            Action::Reanalyze => Some(Outcome::ReanalysisDue),
            Action::Retry => Some(Outcome::ManualRetry),
            Action::Replay => None,
        }
    }
}

/// Decide what, if anything, a cycle should do with `source`.
pub fn plan(source: &Source, now: DateTime<Utc>) -> Option<Action> {
    match source.status {
        SourceStatus::Pending => Some(Action::Analyze),
        SourceStatus::Active => Some(Action::Replay),
        SourceStatus::Stale => {
            let due = source.next_analysis_at.is_none_or(|at| at <= now);
            Some(if due { Action::Reanalyze } else { Action::Replay })
        }
        SourceStatus::Analyzing | SourceStatus::Failed | SourceStatus::Disabled => None,
    }
}

/// Result of processing one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRun {
    pub source_id: Uuid,
    pub url: String,
    pub action: Action,
    pub status: SourceStatus,
    /// Recipe confidence when an analysis ran.
    pub confidence: Option<f64>,
    /// Events extracted when a replay ran.
    pub events: Option<u32>,
    /// Events not previously stored.
    pub new_events: u32,
    pub error: Option<String>,
}

/// Totals for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub analyzed: usize,
    pub replayed: usize,
    pub events: u64,
    pub new_events: u64,
    pub failed: usize,
    pub cancelled: bool,
}

impl CycleSummary {
    fn record(&mut self, run: &SourceRun) {
        match run.action {
            Action::Replay => self.replayed += 1,
            _ => self.analyzed += 1,
        }
        if run.events.is_some() && run.action != Action::Replay {
            self.replayed += 1;
        }
        self.events += u64::from(run.events.unwrap_or(0));
        self.new_events += u64::from(run.new_events);
        if run.error.is_some() {
            self.failed += 1;
        }
    }
}

/// Outcome of [`SchedulerService::register`].
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// Domain handled by a built-in extractor; no source is created.
    Builtin(ExtractorRef),
    /// A source with this URL already exists.
    Existing(Source),
    /// New source, with its first analysis unless registration was deferred.
    Created {
        source: Source,
        run: Option<SourceRun>,
    },
}

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started,
    CycleStarted { due: usize },
    Reconciled { source_id: Uuid, status: SourceStatus },
    SourceStarted { source_id: Uuid, url: &'a str, action: Action },
    SourceCompleted { run: &'a SourceRun },
    SourceFailed { source_id: Uuid, error: &'a str },
    CycleCompleted { summary: &'a CycleSummary },
    ShuttingDown,
    Stopped,
}

/// Trait for receiving scheduler events (decoupled logging).
pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSchedulerReporter;

impl SchedulerReporter for TracingSchedulerReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started => tracing::info!("Scheduler started"),
            SchedulerEvent::CycleStarted { due } => {
                tracing::info!(%due, "Cycle started");
            }
            SchedulerEvent::Reconciled { source_id, status } => {
                tracing::warn!(%source_id, %status, "Repaired inconsistent source state");
            }
            SchedulerEvent::SourceStarted {
                source_id,
                url,
                action,
            } => {
                tracing::info!(%source_id, %url, ?action, "Processing source");
            }
            SchedulerEvent::SourceCompleted { run } => {
                tracing::info!(
                    source_id = %run.source_id,
                    status = %run.status,
                    events = ?run.events,
                    new_events = run.new_events,
                    confidence = ?run.confidence,
                    error = ?run.error,
                    "Source processed"
                );
            }
            SchedulerEvent::SourceFailed { source_id, error } => {
                tracing::error!(%source_id, %error, "Source processing failed");
            }
            SchedulerEvent::CycleCompleted { summary } => {
                tracing::info!(
                    analyzed = summary.analyzed,
                    replayed = summary.replayed,
                    events = summary.events,
                    new_events = summary.new_events,
                    failed = summary.failed,
                    cancelled = summary.cancelled,
                    "Cycle completed"
                );
            }
            SchedulerEvent::ShuttingDown => tracing::info!("Scheduler shutting down"),
            SchedulerEvent::Stopped => tracing::info!("Scheduler stopped"),
        }
    }
}

/// Everything one unit of work needs, cloned per unit.
#[derive(Clone)]
struct Worker<S, F, C, G>
where
    S: SourceStore,
    F: Fetcher,
    C: Cleaner,
    G: RecipeGenerator,
{
    store: S,
    analyzer: PageAnalyzer<F, C, G>,
    replay: ReplayEngine<F>,
    lifecycle: Lifecycle,
}

impl<S, F, C, G> Worker<S, F, C, G>
where
    S: SourceStore,
    F: Fetcher,
    C: Cleaner,
    G: RecipeGenerator,
{
    async fn persist(&self, source: &Source) -> Result<(), AppError> {
        self.store
            .update_source_outcome(source.id, &source.outcome_update())
            .await
    }

    async fn process(&self, mut source: Source, action: Action) -> Result<SourceRun, AppError> {
        let mut run = SourceRun {
            source_id: source.id,
            url: source.url.clone(),
            action,
            status: source.status,
            confidence: None,
            events: None,
            new_events: 0,
            error: None,
        };

        if let Some(entry) = action.entry_outcome() {
            self.lifecycle.apply(&mut source, entry, Utc::now())?;
            self.persist(&source).await?;

            match self.analyzer.analyze(&source.url).await {
                Ok(recipe) => {
                    run.confidence = Some(recipe.confidence());
                    let stored = recipe.clone();
                    self.lifecycle
                        .apply(&mut source, Outcome::Analyzed(recipe), Utc::now())?;
                    self.store
                        .save_recipe(source.id, &stored, source.status)
                        .await?;
                    self.persist(&source).await?;
                    if source.status != SourceStatus::Active {
                        run.error = source.last_error.clone();
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    self.lifecycle.apply(
                        &mut source,
                        Outcome::AnalysisFailed(message.clone()),
                        Utc::now(),
                    )?;
                    self.persist(&source).await?;
                    run.error = Some(message);
                }
            }

            if source.status != SourceStatus::Active {
                run.status = source.status;
                return Ok(run);
            }
        }

        // Replay: either scheduled, or straight after an accepted analysis.
        let Some(recipe) = source.recipe.clone() else {
            return Err(AppError::Generic(format!(
                "source {} has no recipe to replay",
                source.id
            )));
        };

        match self.replay.replay(&source.url, &recipe).await {
            Ok(events) => {
                let mut new_events = 0;
                for event in &events {
                    if self.store.upsert_event(source.id, event).await? {
                        new_events += 1;
                    }
                }
                let count = u32::try_from(events.len()).unwrap_or(u32::MAX);
                self.lifecycle
                    .apply(&mut source, Outcome::Replayed(count), Utc::now())?;
                self.persist(&source).await?;
                run.events = Some(count);
                run.new_events = new_events;
                if source.status == SourceStatus::Failed {
                    run.error = source.last_error.clone();
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.lifecycle.apply(
                    &mut source,
                    Outcome::ReplayFailed(message.clone()),
                    Utc::now(),
                )?;
                self.persist(&source).await?;
                run.error = Some(message);
            }
        }

        run.status = source.status;
        Ok(run)
    }
}

/// Scheduler service: registers sources and runs extraction cycles.
pub struct SchedulerService<S, F, C, G>
where
    S: SourceStore,
    F: Fetcher,
    C: Cleaner,
    G: RecipeGenerator,
{
    worker: Worker<S, F, C, G>,
    config: SchedulerConfig,
}

impl<S, F, C, G> SchedulerService<S, F, C, G>
where
    S: SourceStore + 'static,
    F: Fetcher + 'static,
    C: Cleaner + 'static,
    G: RecipeGenerator + 'static,
{
    pub fn new(
        store: S,
        fetcher: F,
        analyzer: PageAnalyzer<F, C, G>,
        config: SchedulerConfig,
    ) -> Self {
        let lifecycle = Lifecycle {
            policy: config.policy.clone(),
            acceptance_threshold: analyzer.config().acceptance_threshold,
        };
        Self {
            worker: Worker {
                store,
                analyzer,
                replay: ReplayEngine::new(fetcher),
                lifecycle,
            },
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.worker.store
    }

    /// Register a URL and analyze it straight away, so a new source leaves
    /// `pending` before this returns. Built-in domains are not stored; a
    /// known URL returns the existing source.
    pub async fn register(&self, url: &str, name: Option<&str>) -> Result<Registration, AppError> {
        let source = match self.register_deferred(url, name).await? {
            Registration::Created { source, .. } => source,
            other => return Ok(other),
        };

        let run = self.process_source(source.id).await?;
        let source = self.load(source.id).await?;
        Ok(Registration::Created {
            source,
            run: Some(run),
        })
    }

    /// Register a URL without analyzing it; the next cycle picks it up.
    pub async fn register_deferred(
        &self,
        url: &str,
        name: Option<&str>,
    ) -> Result<Registration, AppError> {
        if let Route::Builtin(extractor) = classify(url)? {
            tracing::info!(%url, %extractor, "URL handled by built-in extractor");
            return Ok(Registration::Builtin(extractor));
        }

        if let Some(existing) = self.worker.store.get_source_by_url(url).await? {
            return Ok(Registration::Existing(existing));
        }

        let mut new = NewSource::new(url, extract_domain(url)?);
        if let Some(name) = name {
            new = new.with_name(name);
        }
        let source = self.worker.store.create_source(&new).await?;
        tracing::info!(source_id = %source.id, %url, "Source registered");
        Ok(Registration::Created { source, run: None })
    }

    async fn load(&self, id: Uuid) -> Result<Source, AppError> {
        self.worker
            .store
            .get_source(id)
            .await?
            .ok_or_else(|| AppError::Generic(format!("source {id} not found")))
    }

    /// Process one source now, outside the cycle.
    pub async fn process_source(&self, id: Uuid) -> Result<SourceRun, AppError> {
        let mut source = self.load(id).await?;
        if reconcile(&mut source) {
            self.worker.persist(&source).await?;
        }
        let action = plan(&source, Utc::now()).ok_or_else(|| AppError::InvalidTransition {
            from: source.status.to_string(),
            outcome: "process".into(),
        })?;
        self.worker.process(source, action).await
    }

    /// Operator retry of a failed source: resets the re-analysis budget and
    /// analyzes again.
    pub async fn retry(&self, id: Uuid) -> Result<SourceRun, AppError> {
        let source = self.load(id).await?;
        self.worker.process(source, Action::Retry).await
    }

    /// Flip a source between disabled and its previous state.
    pub async fn toggle(&self, id: Uuid) -> Result<SourceStatus, AppError> {
        let mut source = self.load(id).await?;
        let outcome = if source.status == SourceStatus::Disabled {
            Outcome::Enabled
        } else {
            Outcome::Disabled
        };
        let status = self
            .worker
            .lifecycle
            .apply(&mut source, outcome, Utc::now())?;
        self.worker.persist(&source).await?;
        tracing::info!(source_id = %id, %status, "Source toggled");
        Ok(status)
    }

    /// Run one cycle over every enabled source.
    pub async fn run_cycle<R: SchedulerReporter>(
        &self,
        cancel_token: &CancellationToken,
        reporter: &R,
    ) -> Result<CycleSummary, AppError> {
        let now = Utc::now();
        let sources = self.worker.store.list_enabled_sources().await?;

        let mut due = Vec::with_capacity(sources.len());
        for mut source in sources {
            if reconcile(&mut source) {
                reporter.report(SchedulerEvent::Reconciled {
                    source_id: source.id,
                    status: source.status,
                });
                self.worker.persist(&source).await?;
            }
            if let Some(action) = plan(&source, now) {
                due.push((source, action));
            }
        }

        reporter.report(SchedulerEvent::CycleStarted { due: due.len() });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut summary = CycleSummary::default();
        for (source, action) in due {
            // A unit is reported as started only once it holds a slot.
            let permit = tokio::select! {
                biased;
                () = cancel_token.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| AppError::Generic(e.to_string()))?
                }
            };

            reporter.report(SchedulerEvent::SourceStarted {
                source_id: source.id,
                url: &source.url,
                action,
            });

            let worker = self.worker.clone();
            let token = cancel_token.clone();
            let source_id = source.id;
            tasks.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    biased;
                    () = token.cancelled() => None,
                    result = worker.process(source, action) => Some((source_id, result)),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some((_, Ok(run)))) => {
                    summary.record(&run);
                    reporter.report(SchedulerEvent::SourceCompleted { run: &run });
                }
                Ok(Some((source_id, Err(e)))) => {
                    summary.failed += 1;
                    let error = e.to_string();
                    reporter.report(SchedulerEvent::SourceFailed {
                        source_id,
                        error: &error,
                    });
                }
                Ok(None) => summary.cancelled = true,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(error = %e, "Source task panicked");
                }
            }
        }

        reporter.report(SchedulerEvent::CycleCompleted { summary: &summary });
        Ok(summary)
    }

    /// Run cycles until cancellation.
    pub async fn run<R: SchedulerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &R,
    ) -> Result<(), AppError> {
        reporter.report(SchedulerEvent::Started);

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            if let Err(e) = self.run_cycle(&cancel_token, reporter).await {
                tracing::error!(error = %e, "Cycle failed");
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {}
                () = cancel_token.cancelled() => break,
            }
        }

        reporter.report(SchedulerEvent::ShuttingDown);
        reporter.report(SchedulerEvent::Stopped);
        Ok(())
    }
}
