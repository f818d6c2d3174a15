use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::gauge;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ackset::AckSet;
use crate::message::{MessageHandle, MessageRef, Release};
use crate::sensors::{MetricsSensors, Sensors};
use crate::transport::{ConsumerDriver, DriverError, RebalanceHandler};
use crate::types::{Message, OffsetAndMetadata, TopicPartition};

static CONSUMER_IDS: AtomicUsize = AtomicUsize::new(0);

/// Stream processor invoked for every delivered message.
///
/// The handle may be cloned into derived work; once every clone is dropped
/// the offset is acked automatically (for topics with autoack enabled).
#[async_trait]
pub trait StreamProcessor: Send + Sync {
    async fn on_message(&self, message: MessageHandle) -> anyhow::Result<()>;
}

/// Lifecycle of a consumer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Starting,
    Running,
    Rebalancing,
    Stopping,
    Stopped,
}

pub struct ConsumerOptions {
    pub group_id: String,
    pub topics: Vec<String>,
    /// Default autoack flag, overridable per topic.
    pub autoack: bool,
    pub autoack_overrides: HashMap<String, bool>,
    pub commit_interval: Duration,
    pub sensors: Arc<dyn Sensors>,
    /// When set, the commit loop reports liveness on every tick.
    pub liveness: Option<HealthHandle>,
}

impl ConsumerOptions {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            autoack: true,
            autoack_overrides: HashMap::new(),
            commit_interval: Duration::from_millis(2500),
            sensors: Arc::new(MetricsSensors),
            liveness: None,
        }
    }

    pub fn autoack(mut self, autoack: bool) -> Self {
        self.autoack = autoack;
        self
    }

    pub fn autoack_for_topic(mut self, topic: impl Into<String>, autoack: bool) -> Self {
        self.autoack_overrides.insert(topic.into(), autoack);
        self
    }

    pub fn commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn sensors(mut self, sensors: Arc<dyn Sensors>) -> Self {
        self.sensors = sensors;
        self
    }

    pub fn liveness(mut self, handle: HealthHandle) -> Self {
        self.liveness = Some(handle);
        self
    }
}

/// Orchestrates delivery, ack accounting and periodic commits for one broker
/// session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    id: usize,
    driver: Arc<dyn ConsumerDriver>,
    processor: Arc<dyn StreamProcessor>,
    sensors: Arc<dyn Sensors>,
    liveness: Option<HealthHandle>,
    topics: Vec<String>,
    autoack_default: bool,
    autoack_overrides: HashMap<String, bool>,
    /// True when any topic runs with autoack; gates the best-effort commit
    /// on processor errors.
    autoack_in_force: bool,
    commit_interval: Duration,
    state: RwLock<ConsumerState>,
    acked: Mutex<AckState>,
    /// Only one commit may be in flight per consumer.
    commit_mutex: AsyncMutex<()>,
    releases_tx: mpsc::UnboundedSender<Release>,
    releases_rx: Mutex<Option<mpsc::UnboundedReceiver<Release>>>,
    recently_acked_tx: mpsc::UnboundedSender<(TopicPartition, i64)>,
    recently_acked_rx: Mutex<Option<mpsc::UnboundedReceiver<(TopicPartition, i64)>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Set by whichever path runs the teardown tail first.
    finalized: AtomicBool,
}

#[derive(Default)]
struct AckState {
    acked: HashMap<TopicPartition, AckSet>,
    current: HashMap<TopicPartition, i64>,
    /// Weak views of in-flight messages, for introspection and backpressure.
    dirty: Vec<MessageRef>,
}

impl Consumer {
    pub fn new(
        driver: Arc<dyn ConsumerDriver>,
        options: ConsumerOptions,
        processor: Arc<dyn StreamProcessor>,
    ) -> Self {
        let (releases_tx, releases_rx) = mpsc::unbounded_channel();
        let (recently_acked_tx, recently_acked_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let autoack_in_force =
            options.autoack || options.autoack_overrides.values().any(|&enabled| enabled);
        Self {
            inner: Arc::new(ConsumerInner {
                id: CONSUMER_IDS.fetch_add(1, Ordering::Relaxed),
                driver,
                processor,
                sensors: options.sensors,
                liveness: options.liveness,
                topics: options.topics,
                autoack_default: options.autoack,
                autoack_overrides: options.autoack_overrides,
                autoack_in_force,
                commit_interval: options.commit_interval,
                state: RwLock::new(ConsumerState::Created),
                acked: Mutex::new(AckState::default()),
                commit_mutex: AsyncMutex::new(()),
                releases_tx,
                releases_rx: Mutex::new(Some(releases_rx)),
                recently_acked_tx,
                recently_acked_rx: Mutex::new(Some(recently_acked_rx)),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                finalized: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn state(&self) -> ConsumerState {
        *self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to the configured topics and launches the delivery, commit
    /// and drain loops.
    pub async fn start(&self) -> Result<(), DriverError> {
        self.inner.set_state(ConsumerState::Starting);
        let listener: Arc<dyn RebalanceHandler> = Arc::new(RebalanceListener {
            inner: Arc::downgrade(&self.inner),
        });
        self.inner
            .driver
            .subscribe(&self.inner.topics, listener)
            .await?;

        let releases_rx = self
            .inner
            .releases_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let recently_acked_rx = self
            .inner
            .recently_acked_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let (Some(releases_rx), Some(recently_acked_rx)) = (releases_rx, recently_acked_rx) else {
            return Err(DriverError::Fatal("consumer started twice".to_owned()));
        };

        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(run_loop(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(release_loop(
            self.inner.clone(),
            releases_rx,
            self.inner.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(commit_loop(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(drain_loop(
            self.inner.clone(),
            recently_acked_rx,
            self.inner.shutdown.subscribe(),
        )));
        drop(tasks);

        // A fatal error in a freshly spawned loop may already be tearing the
        // session down; don't walk the state back.
        if matches!(
            self.inner.state(),
            ConsumerState::Starting | ConsumerState::Rebalancing
        ) {
            self.inner.set_state(ConsumerState::Running);
        }
        info!(consumer_id = self.inner.id, topics = ?self.inner.topics, "consumer started");
        Ok(())
    }

    /// Stops the loops, flushes progress best-effort and closes the driver.
    pub async fn stop(&self) {
        if self.state() == ConsumerState::Stopped {
            return;
        }
        self.inner.begin_shutdown();

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            tasks.drain(..).collect()
        };
        for task in tasks {
            drop(task.await);
        }

        self.inner.finalize().await;
        info!(consumer_id = self.inner.id, "consumer stopped");
    }

    /// Records an ack for an offset. Never blocks and never fails; sensor
    /// emission is drained by a dedicated task.
    pub fn ack(&self, tp: TopicPartition, offset: i64) {
        self.inner.ack(tp, offset);
    }

    /// Attempts to advance and commit every partition with pending acks.
    /// Returns whether any commit was performed.
    pub async fn maybe_commit(&self) -> Result<bool, DriverError> {
        self.inner.maybe_commit().await
    }

    /// Highest offset whose commit the broker has acknowledged this session.
    pub fn current_offset(&self, tp: &TopicPartition) -> Option<i64> {
        self.inner.state_guard().current.get(tp).copied()
    }

    /// Acked offsets not yet folded into a commit, a growth measure callers
    /// can use for throttling.
    pub fn pending_acks(&self, tp: &TopicPartition) -> usize {
        self.inner
            .state_guard()
            .acked
            .get(tp)
            .map(AckSet::len)
            .unwrap_or(0)
    }

    /// Number of delivered messages whose handles are still alive.
    pub fn in_flight(&self) -> usize {
        let mut state = self.inner.state_guard();
        state.dirty.retain(|r| !r.is_released());
        state.dirty.len()
    }

    /// Routes a failed processing task: persists progress best-effort when
    /// autoack is in force, then hands the error back to the caller.
    pub async fn on_task_error(&self, err: &anyhow::Error) {
        self.inner.on_task_error(err).await;
    }
}

impl ConsumerInner {
    fn state_guard(&self) -> MutexGuard<'_, AckState> {
        // Ack accounting must survive a panicked peer; recover the data.
        self.acked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConsumerState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!(consumer_id = self.id, from = ?*state, to = ?next, "consumer state change");
        *state = next;
    }

    fn state(&self) -> ConsumerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn autoack_for(&self, topic: &str) -> bool {
        self.autoack_overrides
            .get(topic)
            .copied()
            .unwrap_or(self.autoack_default)
    }

    async fn track_message(&self, message: Message) {
        let tp = message.tp();
        let offset = message.offset;
        let handle = MessageHandle::new(message, self.releases_tx.clone());
        {
            let mut state = self.state_guard();
            state.dirty.retain(|r| !r.is_released());
            state.dirty.push(handle.downgrade());
        }
        // Sensors observe the delivery before the processor runs.
        self.sensors
            .on_message_in(self.id, &tp, offset, handle.message())
            .await;
        if let Err(err) = self.processor.on_message(handle).await {
            self.on_task_error(&err).await;
        }
    }

    async fn on_task_error(&self, err: &anyhow::Error) {
        error!(consumer_id = self.id, "stream processor failed: {err:#}");
        if self.autoack_in_force {
            // Persist whatever progress exists before the error surfaces.
            if let Err(commit_err) = self.maybe_commit().await {
                warn!(
                    consumer_id = self.id,
                    "commit after task error failed: {commit_err}"
                );
            }
        }
    }

    /// Called by the release drain when the last handle to a message drops.
    fn on_message_ready(&self, release: Release) {
        if self.autoack_for(&release.tp.topic) {
            self.ack(release.tp, release.offset);
        }
    }

    fn ack(&self, tp: TopicPartition, offset: i64) {
        {
            let mut state = self.state_guard();
            state.acked.entry(tp.clone()).or_default().insert(offset);
        }
        // The put must not suspend; the queue is unbounded and drained by a
        // dedicated task.
        drop(self.recently_acked_tx.send((tp, offset)));
    }

    async fn maybe_commit(&self) -> Result<bool, DriverError> {
        let _guard = self.commit_mutex.lock().await;
        let tps: Vec<TopicPartition> = {
            let state = self.state_guard();
            state
                .acked
                .iter()
                .filter(|(_, set)| !set.is_empty())
                .map(|(tp, _)| tp.clone())
                .collect()
        };
        self.commit_partitions(&tps).await
    }

    /// Commit pass over the given partitions; the caller holds commit_mutex.
    async fn commit_partitions(&self, tps: &[TopicPartition]) -> Result<bool, DriverError> {
        let mut did_commit = false;
        for tp in tps {
            let candidate = {
                let mut state = self.state_guard();
                let current = state.current.get(tp).copied();
                let Some(set) = state.acked.get_mut(tp) else {
                    continue;
                };
                if let Some(current) = current {
                    // Acks at or below the watermark are echoes of an
                    // earlier commit; skip them silently.
                    set.collapse_through(current);
                }
                set.committable(current)
                    .filter(|&offset| should_commit(current, offset))
            };
            let Some(offset) = candidate else { continue };

            let metadata = self.driver.topic_metadata(&tp.topic).await?;
            let mut offsets = HashMap::new();
            offsets.insert(tp.clone(), OffsetAndMetadata { offset, metadata });
            self.driver.commit(&offsets).await?;

            let mut state = self.state_guard();
            if let Some(set) = state.acked.get_mut(tp) {
                set.collapse_through(offset);
                gauge!("stream_pending_acks", "topic" => tp.topic.clone()).set(set.len() as f64);
            }
            state.current.insert(tp.clone(), offset);
            did_commit = true;
            debug!(consumer_id = self.id, %tp, offset, "committed");
        }
        Ok(did_commit)
    }

    async fn handle_revoked(&self, tps: &[TopicPartition]) {
        info!(consumer_id = self.id, ?tps, "partitions revoked");
        self.set_state(ConsumerState::Rebalancing);
        {
            let _guard = self.commit_mutex.lock().await;
            if let Err(err) = self.commit_partitions(tps).await {
                // Best effort; the next owner replays from the last durable
                // commit.
                warn!(consumer_id = self.id, "commit on revoke failed: {err}");
            }
        }
        let mut state = self.state_guard();
        for tp in tps {
            state.acked.remove(tp);
            state.current.remove(tp);
        }
        state.dirty.retain(|r| !tps.contains(&r.tp));
    }

    async fn handle_assigned(&self, tps: &[TopicPartition]) {
        info!(consumer_id = self.id, ?tps, "partitions assigned");
        for tp in tps {
            // The driver's durable view wins over anything remembered from a
            // previous assignment of this partition.
            let committed = match self.driver.committed_offset(tp).await {
                Ok(committed) => committed,
                Err(err) => {
                    warn!(
                        consumer_id = self.id,
                        %tp,
                        "could not fetch committed offset: {err}"
                    );
                    None
                }
            };
            let mut state = self.state_guard();
            state.acked.remove(tp);
            match committed {
                Some(offset) => {
                    state.current.insert(tp.clone(), offset);
                }
                None => {
                    state.current.remove(tp);
                }
            }
        }
        if matches!(
            self.state(),
            ConsumerState::Rebalancing | ConsumerState::Starting
        ) {
            self.set_state(ConsumerState::Running);
        }
    }

    fn begin_shutdown(&self) {
        self.set_state(ConsumerState::Stopping);
        _ = self.shutdown.send(true);
    }

    /// Teardown tail, run exactly once whether shutdown came from `stop` or
    /// from a fatal driver error: best-effort commit, dirty-list drop,
    /// driver close, then Stopped.
    async fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.maybe_commit().await {
            warn!(consumer_id = self.id, "final commit failed: {err}");
        }
        self.state_guard().dirty.clear();

        if let Err(err) = self.driver.close().await {
            warn!(consumer_id = self.id, "driver close failed: {err}");
        }
        self.set_state(ConsumerState::Stopped);
    }
}

fn should_commit(current: Option<i64>, offset: i64) -> bool {
    // A fresh partition commits from offset zero up; anything at or below an
    // existing watermark is treated as already committed.
    offset > current.unwrap_or(-1)
}

struct RebalanceListener {
    inner: Weak<ConsumerInner>,
}

#[async_trait]
impl RebalanceHandler for RebalanceListener {
    async fn on_partitions_revoked(&self, tps: &[TopicPartition]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_revoked(tps).await;
        }
    }

    async fn on_partitions_assigned(&self, tps: &[TopicPartition]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_assigned(tps).await;
        }
    }
}

async fn run_loop(inner: Arc<ConsumerInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = inner.driver.recv() => match received {
                Ok(message) => inner.track_message(message).await,
                Err(err) if err.is_fatal() => {
                    error!(consumer_id = inner.id, "fatal driver error: {err}");
                    inner.begin_shutdown();
                    inner.finalize().await;
                    break;
                }
                Err(err) => {
                    warn!(consumer_id = inner.id, "receive failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn release_loop(
    inner: Arc<ConsumerInner>,
    mut releases: mpsc::UnboundedReceiver<Release>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            release = releases.recv() => match release {
                Some(release) => inner.on_message_ready(release),
                None => break,
            }
        }
    }
}

async fn commit_loop(inner: Arc<ConsumerInner>, mut shutdown: watch::Receiver<bool>) {
    // Sleep before the first commit so a freshly started consumer does not
    // slam the broker.
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(inner.commit_interval) => {
                if let Some(liveness) = &inner.liveness {
                    liveness.report_healthy().await;
                }
                match inner.maybe_commit().await {
                    Ok(_) => {}
                    Err(err) if err.is_fatal() => {
                        error!(consumer_id = inner.id, "fatal commit error: {err}");
                        inner.begin_shutdown();
                        inner.finalize().await;
                        break;
                    }
                    Err(err) => {
                        warn!(consumer_id = inner.id, "commit failed, will retry: {err}");
                    }
                }
            }
        }
    }
}

async fn drain_loop(
    inner: Arc<ConsumerInner>,
    mut recently_acked: mpsc::UnboundedReceiver<(TopicPartition, i64)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            acked = recently_acked.recv() => match acked {
                Some((tp, offset)) => inner.sensors.on_message_out(inner.id, &tp, offset).await,
                None => break,
            }
        }
    }
}
