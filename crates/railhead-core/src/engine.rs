//! The single-writer engine.
//!
//! Requests are queued to one writer thread. Each cycle the writer drains up to
//! `max_batch` requests, applies each one to a private copy of the current
//! state and commits it, then pushes the whole batch once. A non-fast-forward
//! push means another writer got there first: the writer fetches, resets and
//! re-applies the batch against the new head.

use crate::concurrency::{CancelToken, RepoLock};
use crate::config::{EngineConfig, EventMode, TransformerSettings};
use crate::notify::{Notify, Readiness};
use crate::permissions::Permissions;
use crate::train::{ReleaseTrain, ReleaseTrainPrognosis};
use crate::transformer::{CommitEvent, DbRecord, Transformer, TransformerContext};
use crate::CoreError;
use chrono::Utc;
use railhead_schema::{Actor, AppName, CommitId, EnvName, Version};
use railhead_store::{
    Backoff, CommitEventRow, Credentials, DeploymentRow, EslEvent, EventLog, EventStore,
    EventTx, GarbageCollector, GcReport, GitRepository, ReleaseRow, RepoLayout, Retry, State,
    StoreError, TxMode,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CANCEL_POLL: Duration = Duration::from_millis(20);
const STOP_POLL: Duration = Duration::from_millis(50);

const PENDING: u8 = 0;
const TAKEN: u8 = 1;
const CANCELLED: u8 = 2;

/// Result of one applied request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub commit_id: CommitId,
    pub message: String,
    /// ESL versions of the request's transformers, in order. Empty when the
    /// event log is off.
    pub esl_versions: Vec<i64>,
}

struct Request {
    actor: Actor,
    transformers: Vec<Transformer>,
    claim: Arc<AtomicU8>,
    reply: Sender<Result<ApplyOutcome, CoreError>>,
}

impl Request {
    /// Returns false if the caller cancelled before the writer got to it.
    fn take(&self) -> bool {
        self.claim
            .compare_exchange(PENDING, TAKEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// State shared between the engine handle and its writer thread.
struct Shared {
    snapshot: RwLock<Arc<State>>,
    readiness: Readiness,
    notify: Notify,
    stop: AtomicBool,
    /// Set once an event log commit failed; the log no longer matches git.
    events_diverged: AtomicBool,
}

impl Shared {
    fn publish(&self, state: State) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(state);
    }
}

pub struct Engine {
    config: EngineConfig,
    settings: TransformerSettings,
    layout: RepoLayout,
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Request>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Read connection to the event log; the writer holds its own.
    events: Option<Mutex<EventLog>>,
    _lock: RepoLock,
}

impl Engine {
    /// Open the working directory named in `config` and start the writer.
    ///
    /// Returns before the first state is built; use [`wait_ready`](Self::wait_ready)
    /// before reading.
    pub fn open(config: EngineConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let layout = RepoLayout::new(&config.repository.path);
        layout.initialize()?;
        let lock = RepoLock::try_acquire(&layout.lock_file())?.ok_or_else(|| {
            CoreError::Config(format!(
                "{} is in use by another railhead process",
                layout.root().display()
            ))
        })?;

        let credentials = Credentials::load(
            config.repository.ssh_key_path.as_deref(),
            config.repository.known_hosts_path.as_deref(),
        )?;
        let repo = GitRepository::open(
            &layout.git_dir(),
            &config.repository.branch,
            config.repository.url.as_deref(),
            credentials,
        )?;

        let (writer_log, reader_log) = match config.events.mode {
            EventMode::Off => (None, None),
            EventMode::Esl | EventMode::Full => {
                let path = config.events_path();
                let writer_log = EventLog::open(&path, config.events.tx_retries)?;
                let reader_log = EventLog::open(&path, config.events.tx_retries)?;
                (Some(writer_log), Some(Mutex::new(reader_log)))
            }
        };

        let shared = Arc::new(Shared {
            snapshot: RwLock::new(Arc::new(State::default())),
            readiness: Readiness::new(),
            notify: Notify::new(),
            stop: AtomicBool::new(false),
            events_diverged: AtomicBool::new(false),
        });
        let settings = config.transformer_settings();
        let (sender, receiver) = mpsc::channel();
        let writer = Writer {
            repo,
            events: writer_log,
            state: State::default(),
            committer: Actor::new(
                config.repository.committer_name.as_str(),
                config.repository.committer_email.as_str(),
            ),
            settings: settings.clone(),
            permissions: config.permissions.clone(),
            backoff: config.push.backoff(),
            max_batch: config.repository.max_batch,
            conflict_retries: config.repository.conflict_retries,
            gc_frequency: config.repository.gc_frequency,
            writes_since_gc: 0,
            shared: Arc::clone(&shared),
        };
        let handle = std::thread::Builder::new()
            .name("railhead-writer".to_owned())
            .spawn(move || writer.run(&receiver))?;
        info!("engine started on {}", layout.root().display());

        Ok(Self {
            config,
            settings,
            layout,
            shared,
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(handle)),
            events: reader_log,
            _lock: lock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply `transformers` as one commit on behalf of `actor`.
    pub fn apply(
        &self,
        actor: Actor,
        transformers: Vec<Transformer>,
    ) -> Result<ApplyOutcome, CoreError> {
        self.submit(actor, transformers, None)
    }

    /// Like [`apply`](Self::apply), but gives up with [`CoreError::Cancelled`]
    /// if `cancel` fires while the request is still waiting in the queue.
    pub fn apply_with_cancel(
        &self,
        actor: Actor,
        transformers: Vec<Transformer>,
        cancel: &CancelToken,
    ) -> Result<ApplyOutcome, CoreError> {
        self.submit(actor, transformers, Some(cancel))
    }

    fn submit(
        &self,
        actor: Actor,
        transformers: Vec<Transformer>,
        cancel: Option<&CancelToken>,
    ) -> Result<ApplyOutcome, CoreError> {
        if transformers.is_empty() {
            return Err(CoreError::Validation("request has no transformers".to_owned()));
        }
        for t in &transformers {
            t.validate()?;
        }
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(CoreError::Cancelled);
        }

        let claim = Arc::new(AtomicU8::new(PENDING));
        let (reply, replies) = mpsc::channel();
        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let sender = sender.as_ref().ok_or(CoreError::QueueClosed)?;
            sender
                .send(Request {
                    actor,
                    transformers,
                    claim: Arc::clone(&claim),
                    reply,
                })
                .map_err(|_| CoreError::QueueClosed)?;
        }

        let Some(cancel) = cancel else {
            return replies.recv().map_err(|_| CoreError::QueueClosed)?;
        };
        loop {
            match replies.recv_timeout(CANCEL_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => return Err(CoreError::QueueClosed),
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.is_cancelled()
                        && claim
                            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                    {
                        debug!("request cancelled while queued");
                        return Err(CoreError::Cancelled);
                    }
                }
            }
        }
    }

    /// The latest published state. Never torn: each snapshot is one commit.
    pub fn state(&self) -> Arc<State> {
        Arc::clone(
            &self
                .shared
                .snapshot
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn deployed_version(
        &self,
        env: &EnvName,
        app: &AppName,
    ) -> Result<Option<Version>, CoreError> {
        if self.config.events.mode == EventMode::Full && !self.event_log_diverged() {
            if let Some(log) = &self.events {
                let log = log.lock().unwrap_or_else(PoisonError::into_inner);
                return Ok(log.deployed_version(env, app)?);
            }
        }
        Ok(self.state().deployed_version(env, app)?)
    }

    /// True once an event log commit has failed. Deployment reads are served
    /// from git from then on.
    pub fn event_log_diverged(&self) -> bool {
        self.shared.events_diverged.load(Ordering::SeqCst)
    }

    /// What `train` would do against the current state. Nothing is written.
    pub fn release_train_prognosis(
        &self,
        train: &ReleaseTrain,
        actor: Actor,
    ) -> Result<ReleaseTrainPrognosis, CoreError> {
        train.validate()?;
        let state = self.state();
        let history = match &train.commit_hash {
            Some(_) => Some(GitRepository::open_readonly(
                &self.layout.git_dir(),
                &self.config.repository.branch,
            )?),
            None => None,
        };
        let mut ctx = TransformerContext::new(
            actor,
            Utc::now(),
            &self.settings,
            &self.config.permissions,
        );
        if let Some(history) = &history {
            ctx = ctx.with_history(history);
        }
        train.prognosis(&state, &ctx)
    }

    fn event_log(&self) -> Result<std::sync::MutexGuard<'_, EventLog>, CoreError> {
        let log = self
            .events
            .as_ref()
            .ok_or_else(|| CoreError::Config("the event log is disabled".to_owned()))?;
        Ok(log.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn esl_events(&self, after: i64, limit: u32) -> Result<Vec<EslEvent>, CoreError> {
        Ok(self.event_log()?.esl_events_after(after, limit)?)
    }

    pub fn commit_events(&self, commit: &CommitId) -> Result<Vec<CommitEventRow>, CoreError> {
        Ok(self.event_log()?.commit_events(commit)?)
    }

    pub fn subscribe(&self) -> Receiver<()> {
        self.shared.notify.subscribe()
    }

    pub fn wait_ready(&self) {
        self.shared.readiness.wait();
    }

    pub fn wait_ready_timeout(&self, timeout: Duration) -> bool {
        self.shared.readiness.wait_timeout(timeout)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.readiness.is_ready()
    }

    /// Repack the repository now, independent of the write-count schedule.
    pub fn gc(&self) -> Result<GcReport, CoreError> {
        Ok(GarbageCollector::new(self.layout.git_dir()).repack()?)
    }

    /// Stop accepting requests and wait for the writer to finish what it holds.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("writer thread panicked");
            }
            info!("engine stopped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Writer {
    repo: GitRepository,
    events: Option<EventLog>,
    /// State at the branch head the writer last pushed or fetched.
    state: State,
    committer: Actor,
    settings: TransformerSettings,
    permissions: Permissions,
    backoff: Backoff,
    max_batch: usize,
    conflict_retries: u32,
    gc_frequency: u32,
    writes_since_gc: u32,
    shared: Arc<Shared>,
}

/// Per-request results of a batch and the head state they lead to.
struct BatchResult {
    head: State,
    commits: u32,
    results: Vec<Result<ApplyOutcome, CoreError>>,
}

impl Writer {
    fn run(mut self, requests: &Receiver<Request>) {
        if !self.initialize() {
            return;
        }
        while let Ok(first) = requests.recv() {
            let mut batch = vec![first];
            while batch.len() < self.max_batch {
                match requests.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }
            self.process(batch);
        }
        debug!("write queue closed");
    }

    /// Build the first state, retrying until it works or the engine stops.
    fn initialize(&mut self) -> bool {
        let mut attempt = 0;
        loop {
            match self.reload() {
                Ok(()) => {
                    self.shared.publish(self.state.clone());
                    self.shared.readiness.set_ready();
                    info!(
                        "repository ready at {}",
                        self.state.commit().map_or("<empty>", CommitId::as_str)
                    );
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.base_delay(attempt);
                    warn!("initial fetch failed, retrying in {delay:?}: {e}");
                    if !self.sleep_unless_stopped(delay) {
                        return false;
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let mut remaining = delay;
        while !remaining.is_zero() {
            if self.shared.stop.load(Ordering::SeqCst) {
                return false;
            }
            let step = remaining.min(STOP_POLL);
            std::thread::sleep(step);
            remaining -= step;
        }
        !self.shared.stop.load(Ordering::SeqCst)
    }

    fn reload(&mut self) -> Result<(), CoreError> {
        self.repo.fetch_and_reset()?;
        self.state = self.repo.load_state()?;
        Ok(())
    }

    fn process(&mut self, batch: Vec<Request>) {
        let batch: Vec<Request> = batch.into_iter().filter(Request::take).collect();
        if batch.is_empty() {
            return;
        }
        debug!("processing batch of {} requests", batch.len());

        let mut conflicts = 0;
        let mut reloaded = false;
        let outcome = loop {
            match self.apply_batch(&batch) {
                Err(CoreError::Store(StoreError::NonFastForward(reason)))
                    if conflicts < self.conflict_retries =>
                {
                    conflicts += 1;
                    warn!(
                        "push conflict ({conflicts}/{}), re-applying on the new head: {reason}",
                        self.conflict_retries
                    );
                    if let Err(e) = self.reload() {
                        break Err(e);
                    }
                    reloaded = true;
                }
                Err(CoreError::Store(StoreError::NonFastForward(reason))) => {
                    break Err(CoreError::Conflict(format!(
                        "gave up after {conflicts} retries: {reason}"
                    )));
                }
                other => break other,
            }
        };

        match outcome {
            Ok(BatchResult {
                head,
                commits,
                results,
            }) => {
                if commits > 0 || reloaded {
                    self.state = head;
                    self.shared.publish(self.state.clone());
                    self.shared.notify.notify();
                }
                self.maybe_gc(commits);
                for (request, result) in batch.into_iter().zip(results) {
                    let _ = request.reply.send(result);
                }
            }
            Err(e) => {
                error!("write batch failed: {e}");
                if reloaded {
                    self.shared.publish(self.state.clone());
                }
                for request in batch {
                    let _ = request.reply.send(Err(clone_batch_error(&e)));
                }
            }
        }
    }

    /// Apply every request on top of the current head, commit each one and
    /// push once. On any batch-level failure the local branch is put back.
    fn apply_batch(&mut self, batch: &[Request]) -> Result<BatchResult, CoreError> {
        let base_commit = self.state.commit().cloned();
        let tx = match self.events.as_mut() {
            Some(log) => Some(log.transaction(TxMode::ReadWrite)?),
            None => None,
        };

        let mut head = self.state.clone();
        let mut commits = 0;
        let mut results = Vec::with_capacity(batch.len());
        let applied = (|| -> Result<(), CoreError> {
            for request in batch {
                let savepoint = tx.as_ref().map(EventTx::savepoint).transpose()?;
                let store = savepoint.as_ref().map(|s| s as &dyn EventStore);
                let env = RequestEnv {
                    repo: &self.repo,
                    committer: &self.committer,
                    settings: &self.settings,
                    permissions: &self.permissions,
                    store,
                };
                match env.apply(&head, request) {
                    Ok((state, outcome)) => {
                        if let Some(savepoint) = savepoint {
                            savepoint.release()?;
                        }
                        info!("committed {}: {}", outcome.commit_id, first_line(&outcome.message));
                        head = state;
                        commits += 1;
                        results.push(Ok(outcome));
                    }
                    Err(e) if e.is_internal() => return Err(e),
                    Err(e) => {
                        debug!("request rejected: {e}");
                        results.push(Err(e));
                    }
                }
            }
            if commits > 0 {
                push(&self.repo, &self.backoff)?;
            }
            Ok(())
        })();

        if let Err(e) = applied {
            if commits > 0 {
                if let Err(reset) = self.repo.reset_branch(base_commit.as_ref()) {
                    warn!("could not discard unpushed commits: {reset}");
                }
            }
            return Err(e);
        }
        if let Some(tx) = tx {
            if let Err(e) = tx.commit() {
                error!("event log commit failed, deployment reads fall back to git: {e}");
                self.shared.events_diverged.store(true, Ordering::SeqCst);
            }
        }
        Ok(BatchResult {
            head,
            commits,
            results,
        })
    }

    fn maybe_gc(&mut self, commits: u32) {
        if self.gc_frequency == 0 {
            return;
        }
        self.writes_since_gc += commits;
        if self.writes_since_gc < self.gc_frequency {
            return;
        }
        self.writes_since_gc = 0;
        match GarbageCollector::for_repository(&self.repo).repack() {
            Ok(report) => info!(
                "repacked repository: {} loose objects left, {} packs in {:?}",
                report.loose_after, report.packs_after, report.elapsed
            ),
            Err(e) => warn!("repository gc failed: {e}"),
        }
    }
}

/// Push with backoff. Rejections that cannot heal by waiting are permanent;
/// a non-fast-forward is handled by the caller.
fn push(repo: &GitRepository, backoff: &Backoff) -> Result<(), CoreError> {
    if !repo.has_remote() {
        return Ok(());
    }
    backoff
        .retry(|| {
            repo.push().map_err(|e| match e {
                StoreError::NonFastForward(_)
                | StoreError::PushRejected { .. }
                | StoreError::HostKey(_)
                | StoreError::Credentials(_) => Retry::Permanent(e),
                e => Retry::Transient(e),
            })
        })
        .map_err(CoreError::from)
}

/// Everything one request needs, borrowed from the writer.
struct RequestEnv<'a> {
    repo: &'a GitRepository,
    committer: &'a Actor,
    settings: &'a TransformerSettings,
    permissions: &'a Permissions,
    store: Option<&'a dyn EventStore>,
}

impl RequestEnv<'_> {
    fn apply(&self, base: &State, request: &Request) -> Result<(State, ApplyOutcome), CoreError> {
        let now = Utc::now();
        let created = now.to_rfc3339();
        let mut state = base.clone();
        let mut ctx = TransformerContext::new(
            request.actor.clone(),
            now,
            self.settings,
            self.permissions,
        )
        .with_history(self.repo);

        let mut messages = Vec::with_capacity(request.transformers.len());
        let mut esl_versions = Vec::new();
        for transformer in &request.transformers {
            ctx.esl_version = match self.store {
                Some(store) => Some(store.insert_esl(
                    &created,
                    transformer.event_type(),
                    &serde_json::to_string(transformer)?,
                )?),
                None => None,
            };
            messages.push(transformer.transform(&mut state, &mut ctx)?);
            let (events, records) = ctx.take_audit();
            if let Some(store) = self.store {
                write_audit(store, &created, ctx.esl_version, &events, &records)?;
            }
            esl_versions.extend(ctx.esl_version);
        }

        if let Some(store) = self.store {
            let apps = state.applications();
            if apps != base.applications() {
                let names: Vec<String> = apps.into_iter().map(AppName::into_inner).collect();
                store.insert_all_apps(&created, &names)?;
            }
        }

        let message = messages.join("\n");
        let commit_id = self.repo.commit(
            base.commit(),
            state.tree(),
            &message,
            &request.actor,
            self.committer,
        )?;
        let state = State::new(Some(commit_id.clone()), state.into_tree());
        Ok((
            state,
            ApplyOutcome {
                commit_id,
                message,
                esl_versions,
            },
        ))
    }
}

fn write_audit(
    store: &dyn EventStore,
    created: &str,
    esl_version: Option<i64>,
    events: &[CommitEvent],
    records: &[DbRecord],
) -> Result<(), CoreError> {
    for event in events {
        store.insert_commit_event(&CommitEventRow {
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: created.to_owned(),
            commit_hash: event.commit.to_string(),
            event_type: event.event.kind().to_string(),
            json: serde_json::to_string(&event.event)?,
            transformer_esl_version: esl_version,
        })?;
    }
    for record in records {
        match record {
            DbRecord::Deployment {
                environment,
                application,
                deployment,
            } => store.insert_deployment(
                created,
                &DeploymentRow {
                    environment: environment.to_string(),
                    application: application.to_string(),
                    version: Some(deployment.version),
                    metadata: serde_json::to_string(deployment)?,
                },
                esl_version,
            )?,
            DbRecord::Release {
                application,
                release,
                deleted,
            } => store.insert_release(
                created,
                &ReleaseRow {
                    application: application.to_string(),
                    version: release.version,
                    metadata: serde_json::to_string(release)?,
                    deleted: *deleted,
                },
                esl_version,
            )?,
        }
    }
    Ok(())
}

/// Batch-level failures are reported to every request of the batch. Store
/// faults are not `Clone`, so they are flattened to their message.
fn clone_batch_error(e: &CoreError) -> CoreError {
    match e {
        CoreError::Conflict(reason) => CoreError::Conflict(reason.clone()),
        CoreError::Config(reason) => CoreError::Config(reason.clone()),
        other => CoreError::Io(std::io::Error::other(other.to_string())),
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::DeployApplicationVersion;
    use crate::environment::CreateEnvironment;
    use crate::locks::CreateEnvironmentLock;
    use crate::release::CreateApplicationVersion;
    use railhead_schema::{EnvironmentConfig, LockBehaviour};
    use std::collections::BTreeMap;

    fn actor() -> Actor {
        Actor::new("Ada", "ada@example.com")
    }

    fn open(dir: &std::path::Path, mode: EventMode) -> Engine {
        let mut config = EngineConfig::for_local(dir);
        config.events.mode = mode;
        let engine = Engine::open(config).unwrap();
        assert!(engine.wait_ready_timeout(Duration::from_secs(10)));
        engine
    }

    fn release(app: &str, env: &str, manifest: &str) -> Transformer {
        let mut manifests = BTreeMap::new();
        manifests.insert(EnvName::new(env), manifest.to_owned());
        Transformer::CreateApplicationVersion(CreateApplicationVersion::new(app, manifests))
    }

    fn create_env(env: &str, config: EnvironmentConfig) -> Transformer {
        Transformer::CreateEnvironment(CreateEnvironment::new(env, config))
    }

    #[test]
    fn release_auto_deploys_to_latest_environment() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Off);

        engine
            .apply(actor(), vec![create_env("dev", EnvironmentConfig::upstream_latest())])
            .unwrap();
        let outcome = engine.apply(actor(), vec![release("foo", "dev", "m1")]).unwrap();

        assert!(outcome.message.starts_with("created version 1 of \"foo\""));
        assert!(outcome.esl_versions.is_empty());
        let state = engine.state();
        assert_eq!(state.commit(), Some(&outcome.commit_id));
        assert_eq!(
            engine
                .deployed_version(&EnvName::new("dev"), &AppName::new("foo"))
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn failed_request_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Off);
        engine
            .apply(actor(), vec![create_env("dev", EnvironmentConfig::upstream_latest())])
            .unwrap();
        let before = engine.state();

        let err = engine
            .apply(
                actor(),
                vec![
                    Transformer::CreateEnvironmentLock(CreateEnvironmentLock::new(
                        "dev", "freeze", "hold",
                    )),
                    create_env("dev", EnvironmentConfig::upstream_latest()),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists(_)));

        let after = engine.state();
        assert_eq!(after.commit(), before.commit());
        assert!(after
            .environment_locks(&EnvName::new("dev"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn locked_deploy_reports_blocking_locks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Off);
        engine
            .apply(
                actor(),
                vec![
                    create_env("dev", EnvironmentConfig::upstream_latest()),
                    release("foo", "dev", "m1"),
                    Transformer::CreateEnvironmentLock(CreateEnvironmentLock::new(
                        "dev", "freeze", "hold",
                    )),
                ],
            )
            .unwrap();
        engine.apply(actor(), vec![release("foo", "dev", "m2")]).unwrap();

        let err = engine
            .apply(
                actor(),
                vec![Transformer::DeployApplicationVersion(
                    DeployApplicationVersion::new("dev", "foo", 2, LockBehaviour::Fail),
                )],
            )
            .unwrap_err();
        let locked = err.as_locked().unwrap();
        assert!(locked.environment_locks.contains_key("freeze"));
        assert_eq!(
            engine
                .deployed_version(&EnvName::new("dev"), &AppName::new("foo"))
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn empty_request_is_rejected_before_queueing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Off);
        assert!(matches!(
            engine.apply(actor(), Vec::new()),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn cancelled_token_never_reaches_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Off);
        let token = CancelToken::new();
        token.cancel();
        let err = engine
            .apply_with_cancel(
                actor(),
                vec![create_env("dev", EnvironmentConfig::upstream_latest())],
                &token,
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(engine.state().environment_names().is_empty());
    }

    #[test]
    fn second_engine_on_same_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let _engine = open(dir.path(), EventMode::Off);
        let err = Engine::open(EngineConfig::for_local(dir.path())).err().unwrap();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = open(dir.path(), EventMode::Off);
            engine
                .apply(actor(), vec![create_env("dev", EnvironmentConfig::upstream_latest())])
                .unwrap();
        }
        let engine = open(dir.path(), EventMode::Off);
        assert_eq!(engine.state().environment_names(), vec![EnvName::new("dev")]);
    }

    #[test]
    fn event_log_mirrors_requests() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Full);
        let first = engine
            .apply(actor(), vec![create_env("dev", EnvironmentConfig::upstream_latest())])
            .unwrap();
        let second = engine.apply(actor(), vec![release("foo", "dev", "m1")]).unwrap();
        assert_eq!(first.esl_versions.len(), 1);
        assert!(second.esl_versions[0] > first.esl_versions[0]);

        let events = engine.esl_events(0, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "CreateEnvironment");
        assert_eq!(events[1].event_type, "CreateApplicationVersion");
        let replayed: Transformer = serde_json::from_str(&events[1].json).unwrap();
        assert_eq!(replayed, release("foo", "dev", "m1"));

        assert_eq!(
            engine
                .deployed_version(&EnvName::new("dev"), &AppName::new("foo"))
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn diverged_event_log_is_not_trusted_for_deployments() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Full);
        engine
            .apply(actor(), vec![create_env("dev", EnvironmentConfig::upstream_latest())])
            .unwrap();
        engine.apply(actor(), vec![release("foo", "dev", "m1")]).unwrap();

        let mut stray = EventLog::open(engine.config.events_path(), 0).unwrap();
        let tx = stray.transaction(TxMode::ReadWrite).unwrap();
        tx.insert_deployment(
            "2026-01-01T00:00:00Z",
            &DeploymentRow {
                environment: "dev".to_owned(),
                application: "foo".to_owned(),
                version: Some(7),
                metadata: "{}".to_owned(),
            },
            None,
        )
        .unwrap();
        tx.commit().unwrap();

        let dev = EnvName::new("dev");
        let foo = AppName::new("foo");
        assert_eq!(engine.deployed_version(&dev, &foo).unwrap(), Some(7));
        assert!(!engine.event_log_diverged());

        engine.shared.events_diverged.store(true, Ordering::SeqCst);
        assert!(engine.event_log_diverged());
        assert_eq!(engine.deployed_version(&dev, &foo).unwrap(), Some(1));
    }

    #[test]
    fn subscribers_hear_about_commits() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Off);
        let changes = engine.subscribe();
        engine
            .apply(actor(), vec![create_env("dev", EnvironmentConfig::upstream_latest())])
            .unwrap();
        assert!(changes.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn shutdown_closes_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path(), EventMode::Off);
        engine.shutdown();
        let err = engine
            .apply(actor(), vec![create_env("dev", EnvironmentConfig::upstream_latest())])
            .unwrap_err();
        assert!(matches!(err, CoreError::QueueClosed));
    }
}
