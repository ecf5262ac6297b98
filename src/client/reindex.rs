//! Debounced, count-gated reindex scheduler
//!
//! File-change events are filtered, counted and debounced. Once the project
//! has been quiet for the debounce window and enough relevant files changed,
//! one reindex call is issued. A finished reindex (success or failure) always
//! resets the counter; failures are reported, never retried here.

use super::api::BackendClient;
use super::outcome::RequestOutcome;
use crate::error::RequestError;
use crate::protocol::ReindexResponse;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(5);
pub const DEFAULT_CHANGE_THRESHOLD: usize = 5;

const DEFAULT_EXTENSIONS: &[&str] = &[
    "js", "jsx", "ts", "tsx", "mjs", "cjs", "py", "rs", "go", "java", "kt", "scala", "c", "h",
    "cpp", "hpp", "cc", "cs", "rb", "php", "swift", "vue", "svelte", "html", "css", "scss",
    "json", "md", "yaml", "yml", "toml", "sh", "sql",
];

const DEFAULT_EXCLUDED: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/build/**",
    "**/out/**",
    "**/target/**",
    "**/coverage/**",
    "**/__pycache__/**",
    "**/.venv/**",
    "**/venv/**",
    "**/cody_index/**",
];

/// Event source seam: whatever watches the filesystem calls this.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, path: &Path);
}

/// Performs one reindex. The production runner goes through the
/// orchestrator as a non-cached operation.
#[async_trait]
pub trait ReindexRunner: Send + Sync {
    async fn run(&self) -> RequestOutcome<ReindexResponse>;
}

pub struct BackendReindexRunner {
    client: BackendClient,
    project_path: String,
}

impl BackendReindexRunner {
    pub fn new(client: BackendClient, project_path: impl Into<String>) -> Self {
        Self {
            client,
            project_path: project_path.into(),
        }
    }
}

#[async_trait]
impl ReindexRunner for BackendReindexRunner {
    async fn run(&self) -> RequestOutcome<ReindexResponse> {
        self.client.reindex(&self.project_path).await
    }
}

/// Extension allow-list plus directory deny-list.
///
/// Exclude globs are matched against the path relative to the watch root,
/// so directories above the project never count.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    extensions: HashSet<String>,
    excluded: GlobSet,
    root: Option<PathBuf>,
}

impl WatchFilter {
    pub fn new(extensions: &[&str], excluded_globs: &[&str]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in excluded_globs {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            excluded: builder.build()?,
            root: None,
        })
    }

    /// Watched project root; event paths are matched relative to it.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn is_relevant(&self, path: &Path) -> bool {
        let relative = self
            .root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok())
            .unwrap_or(path);
        let unified = relative.to_string_lossy().replace('\\', "/");
        if self.excluded.is_match(&unified) {
            return false;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

impl Default for WatchFilter {
    fn default() -> Self {
        match Self::new(DEFAULT_EXTENSIONS, DEFAULT_EXCLUDED) {
            Ok(filter) => filter,
            Err(err) => {
                warn!("Default exclude globs failed to compile: {}", err);
                Self {
                    extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
                    excluded: GlobSet::empty(),
                    root: None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Idle,
    Accumulating,
    Indexing,
}

#[derive(Debug, Clone, Copy)]
pub struct TriggerConfig {
    pub threshold: usize,
    pub debounce: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CHANGE_THRESHOLD,
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Result of an explicit "reindex now" request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualTrigger {
    Started,
    AlreadyIndexing,
}

struct Counter {
    change_count: usize,
    pending_timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is restarted; a timer that wakes with an
    /// older value lost a race with a newer event and does nothing.
    timer_epoch: u64,
    last_outcome: Option<RequestOutcome<ReindexResponse>>,
}

struct TriggerInner {
    counter: Mutex<Counter>,
    state: watch::Sender<TriggerState>,
    runner: Arc<dyn ReindexRunner>,
    filter: WatchFilter,
    config: TriggerConfig,
}

#[derive(Clone)]
pub struct ReindexTrigger {
    inner: Arc<TriggerInner>,
}

impl ReindexTrigger {
    pub fn new(runner: Arc<dyn ReindexRunner>, filter: WatchFilter, config: TriggerConfig) -> Self {
        let (state, _) = watch::channel(TriggerState::Idle);
        Self {
            inner: Arc::new(TriggerInner {
                counter: Mutex::new(Counter {
                    change_count: 0,
                    pending_timer: None,
                    timer_epoch: 0,
                    last_outcome: None,
                }),
                state,
                runner,
                filter,
                config: TriggerConfig {
                    threshold: config.threshold.max(1),
                    ..config
                },
            }),
        }
    }

    pub fn state(&self) -> TriggerState {
        *self.inner.state.borrow()
    }

    pub fn change_count(&self) -> usize {
        self.lock().change_count
    }

    pub fn last_outcome(&self) -> Option<RequestOutcome<ReindexResponse>> {
        self.lock().last_outcome.clone()
    }

    /// Count one file change and restart the debounce timer. Returns whether
    /// the event was counted. Must be called from inside a tokio runtime.
    pub fn record_change(&self, path: &Path) -> bool {
        if !self.inner.filter.is_relevant(path) {
            return false;
        }
        let mut counter = self.lock();
        // Checked under the counter lock; every state change happens there too.
        match self.state() {
            TriggerState::Indexing => {
                debug!("Ignoring change to {} while indexing", path.display());
                return false;
            }
            TriggerState::Idle => {
                self.inner.state.send_replace(TriggerState::Accumulating);
            }
            TriggerState::Accumulating => {}
        }

        counter.change_count += 1;
        counter.timer_epoch += 1;
        if let Some(timer) = counter.pending_timer.take() {
            timer.abort();
        }

        let epoch = counter.timer_epoch;
        let debounce = self.inner.config.debounce;
        let trigger = self.clone();
        counter.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            trigger.on_quiet(epoch);
        }));
        debug!(
            "{} changed ({} pending)",
            path.display(),
            counter.change_count
        );
        true
    }

    /// Reindex now, bypassing threshold and debounce.
    pub fn trigger_now(&self) -> ManualTrigger {
        let mut counter = self.lock();
        if self.state() == TriggerState::Indexing {
            info!("Reindex already in progress");
            return ManualTrigger::AlreadyIndexing;
        }
        if let Some(timer) = counter.pending_timer.take() {
            timer.abort();
        }
        counter.timer_epoch += 1;
        self.inner.state.send_replace(TriggerState::Indexing);
        drop(counter);
        self.spawn_run("manual request");
        ManualTrigger::Started
    }

    /// Resolve once no reindex is running.
    pub async fn wait_until_settled(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state != TriggerState::Indexing).await;
    }

    fn on_quiet(&self, epoch: u64) {
        let mut counter = self.lock();
        if counter.timer_epoch != epoch {
            return;
        }
        counter.pending_timer = None;
        if self.state() != TriggerState::Accumulating {
            return;
        }
        if counter.change_count < self.inner.config.threshold {
            debug!(
                "{} change(s) below threshold of {}; waiting for more",
                counter.change_count, self.inner.config.threshold
            );
            return;
        }
        self.inner.state.send_replace(TriggerState::Indexing);
        let reason = format!("{} file changes", counter.change_count);
        drop(counter);
        self.spawn_run(&reason);
    }

    /// The run gets its own task so aborting a debounce timer can never
    /// cancel a reindex that already started. A runner that panics still
    /// settles the trigger back to `Idle`.
    fn spawn_run(&self, reason: &str) {
        info!("Reindexing ({})", reason);
        let trigger = self.clone();
        let runner = Arc::clone(&self.inner.runner);
        tokio::spawn(async move {
            let run = tokio::spawn(async move { runner.run().await });
            let outcome = run.await.unwrap_or_else(|err| {
                RequestOutcome::failure(RequestError::Backend(format!(
                    "reindex task failed: {}",
                    err
                )))
            });
            trigger.finish(outcome);
        });
    }

    fn finish(&self, outcome: RequestOutcome<ReindexResponse>) {
        let mut counter = self.lock();
        match &outcome {
            RequestOutcome::Success { data } => info!("Reindex finished: {}", data.message),
            RequestOutcome::Failure { error } => warn!("Reindex failed: {}", error),
        }
        counter.change_count = 0;
        counter.last_outcome = Some(outcome);
        self.inner.state.send_replace(TriggerState::Idle);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counter> {
        self.inner
            .counter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl ChangeListener for ReindexTrigger {
    fn on_change(&self, path: &Path) {
        self.record_change(path);
    }
}
