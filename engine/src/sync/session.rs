use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{
    Conflict, StoreReport, SyncApplyError, SyncDirection, SyncOperation, SyncOptions, SyncReport,
};
use crate::adapter::ScanOptions;
use crate::watch::{EventSink, Subscription};
use crate::{
    error::Result, Database, Error, Key, MutationEvent, MutationKind, StoreAccessor,
};

/// Observable state of a [`SyncSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Created,
    Started,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Started,
    Paused,
    /// Draining the pause queue; new events still queue
    Resuming,
    Stopped,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Started => "started",
            Phase::Paused => "paused",
            Phase::Resuming => "resuming",
            Phase::Stopped => "stopped",
        }
    }

    fn invalid(self, operation: &'static str) -> Error {
        Error::InvalidSyncState {
            operation,
            state: self.name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Source,
    Target,
}

struct Pending {
    side: Side,
    event: MutationEvent,
}

struct State {
    phase: Phase,
    queue: VecDeque<Pending>,
    subscriptions: Vec<Subscription>,
    tasks: Vec<JoinHandle<()>>,
    live: Option<mpsc::UnboundedSender<Pending>>,
}

struct Shared {
    source: Database,
    target: Database,
    options: SyncOptions,
    state: Mutex<State>,
    /// Live events handed to the applier and not yet applied
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Keeps stores of two databases converging.
///
/// Dropping the session stops it.
pub struct SyncSession {
    shared: Arc<Shared>,
}

impl SyncSession {
    /// Create a session between `source` and `target`. Nothing flows until
    /// [`SyncSession::start`].
    pub fn new(source: &Database, target: &Database, options: SyncOptions) -> Result<Self> {
        if options.stores.is_empty() {
            return Err(Error::Config("sync needs at least one store".into()));
        }
        if options.pull_interval.is_zero() {
            return Err(Error::Config("pull interval must be positive".into()));
        }
        if source.origin() == target.origin() {
            return Err(Error::Config(
                "sync source and target must be different handles".into(),
            ));
        }
        for store in &options.stores {
            source.schema().store(store)?;
            target.schema().store(store)?;
        }
        Ok(Self {
            shared: Arc::new(Shared {
                source: source.clone(),
                target: target.clone(),
                options,
                state: Mutex::new(State {
                    phase: Phase::Created,
                    queue: VecDeque::new(),
                    subscriptions: Vec::new(),
                    tasks: Vec::new(),
                    live: None,
                }),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        match self.shared.phase() {
            Phase::Created => SyncState::Created,
            Phase::Started => SyncState::Started,
            Phase::Paused | Phase::Resuming => SyncState::Paused,
            Phase::Stopped => SyncState::Stopped,
        }
    }

    /// Events waiting in the pause queue.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Attach subscriptions and start the pull timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Config("sync sessions must start inside a tokio runtime".into()))?;
        let shared = &self.shared;
        let direction = shared.options.direction;
        let weak = Arc::downgrade(shared);

        let mut state = shared.state.lock();
        if state.phase != Phase::Created {
            return Err(state.phase.invalid("start"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.live = Some(tx);
        state.tasks.push(runtime.spawn(run_applier(weak.clone(), rx)));

        if direction.pushes() {
            for store in &shared.options.stores {
                let sink = queueing_sink(weak.clone(), Side::Source);
                state
                    .subscriptions
                    .push(shared.source.hub().subscribe(store, sink));
            }
        }
        if direction == SyncDirection::Bidirectional {
            for store in &shared.options.stores {
                let sink = queueing_sink(weak.clone(), Side::Target);
                state
                    .subscriptions
                    .push(shared.target.hub().subscribe(store, sink));
            }
        }
        if direction.pulls() {
            let period = shared.options.pull_interval;
            state.tasks.push(runtime.spawn(run_puller(weak, period)));
        }

        state.phase = Phase::Started;
        tracing::info!(
            source = %shared.source.name(),
            target = %shared.target.name(),
            direction = ?direction,
            stores = ?shared.options.stores,
            "sync started"
        );
        Ok(())
    }

    /// Stop applying events; they queue until [`SyncSession::resume`].
    pub fn pause(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.phase != Phase::Started {
            return Err(state.phase.invalid("pause"));
        }
        state.phase = Phase::Paused;
        tracing::debug!(source = %self.shared.source.name(), "sync paused");
        Ok(())
    }

    /// Apply queued events in order, then go back to live dispatch.
    ///
    /// Returns once the queue is empty, including events that arrived while
    /// it was draining.
    pub async fn resume(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match state.phase {
                Phase::Paused | Phase::Resuming => state.phase = Phase::Resuming,
                phase => return Err(phase.invalid("resume")),
            }
        }
        // Live events dispatched before the pause go first
        self.flush().await;

        let mut replayed = 0usize;
        loop {
            let next = {
                let mut state = self.shared.state.lock();
                if state.phase == Phase::Stopped {
                    return Ok(());
                }
                match state.queue.pop_front() {
                    Some(pending) => pending,
                    None => {
                        state.phase = Phase::Started;
                        break;
                    }
                }
            };
            self.shared.apply(next).await;
            replayed += 1;
        }
        tracing::debug!(source = %self.shared.source.name(), replayed, "sync resumed");
        Ok(())
    }

    /// Wait until every live event dispatched so far has been applied.
    pub async fn flush(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0
                || self.shared.phase() == Phase::Stopped
            {
                return;
            }
            notified.await;
        }
    }

    /// Detach subscriptions, stop tasks and discard queued events.
    /// Idempotent.
    pub fn stop(&self) {
        if self.shared.shutdown() {
            tracing::info!(
                source = %self.shared.source.name(),
                target = %self.shared.target.name(),
                "sync stopped"
            );
        }
    }

    /// Diff every configured store and reconcile the differences.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        self.shared.sync_all().await
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("source", &self.shared.source.name())
            .field("target", &self.shared.target.name())
            .field("state", &self.state())
            .field("options", &self.shared.options)
            .finish()
    }
}

fn queueing_sink(shared: Weak<Shared>, side: Side) -> EventSink {
    Arc::new(move |event: &MutationEvent| {
        if let Some(shared) = shared.upgrade() {
            shared.enqueue(Pending {
                side,
                event: event.clone(),
            });
        }
    })
}

async fn run_applier(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<Pending>) {
    while let Some(pending) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.apply(pending).await;
        shared.finish_one();
    }
}

async fn run_puller(shared: Weak<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.phase() != Phase::Started {
            continue;
        }
        match shared.sync_all().await {
            Ok(report) => tracing::debug!(
                copied = report.copied(),
                conflicts = report.conflicts.len(),
                errors = report.errors(),
                "sync pull finished"
            ),
            Err(err) => tracing::warn!(error = %err, "sync pull failed"),
        }
    }
}

impl Shared {
    fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    fn enqueue(&self, pending: Pending) {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Started => {
                if let Some(live) = &state.live {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    if live.send(pending).is_err() {
                        self.finish_one();
                    }
                }
            }
            Phase::Paused | Phase::Resuming => state.queue.push_back(pending),
            Phase::Created | Phase::Stopped => {}
        }
    }

    fn finish_one(&self) {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    /// Returns whether this call performed the shutdown.
    fn shutdown(&self) -> bool {
        let (subscriptions, tasks) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Stopped {
                return false;
            }
            state.phase = Phase::Stopped;
            state.queue.clear();
            state.live = None;
            (
                std::mem::take(&mut state.subscriptions),
                std::mem::take(&mut state.tasks),
            )
        };
        drop(subscriptions);
        for task in tasks {
            task.abort();
        }
        self.in_flight.store(0, Ordering::SeqCst);
        self.idle.notify_waiters();
        true
    }

    /// Whether the side opposite to where a change happened may be written
    /// back to.
    fn writes_to(&self, side: Side) -> bool {
        match side {
            Side::Source => self.options.direction.pulls(),
            Side::Target => self.options.direction.pushes(),
        }
    }

    fn report(&self, failure: SyncApplyError) {
        tracing::warn!(
            store = %failure.store,
            operation = %failure.operation,
            key = ?failure.key,
            error = %failure.error,
            "sync apply failed"
        );
        if let Some(callback) = &self.options.on_error {
            callback(&failure);
        }
    }

    async fn apply(&self, pending: Pending) {
        let Pending { side, event } = pending;
        if let Err(error) = self.mirror(side, &event).await {
            self.report(SyncApplyError {
                store: event.store.clone(),
                operation: event.kind.into(),
                key: event.key.clone(),
                error,
            });
        }
    }

    /// Replay an event from `side` onto the other side.
    async fn mirror(&self, side: Side, event: &MutationEvent) -> Result<()> {
        let (origin, destination) = match side {
            Side::Source => (&self.source, &self.target),
            Side::Target => (&self.target, &self.source),
        };
        let dest = destination.store(&event.store)?;

        match event.kind {
            MutationKind::Clear => {
                if dest.count(ScanOptions::default()).await? > 0 {
                    dest.clear().await?;
                }
            }
            MutationKind::Delete => {
                let Some(key) = &event.key else {
                    return Ok(());
                };
                if dest.get(key.clone()).await?.is_some() {
                    dest.delete(key.clone()).await?;
                }
            }
            MutationKind::Put => {
                let (Some(key), Some(value)) = (&event.key, &event.value) else {
                    return Ok(());
                };
                let existing = dest.get(key.clone()).await?;
                let winner = match &existing {
                    None => value.clone(),
                    Some(current) if current == value => return Ok(()),
                    Some(current) => {
                        let (source, target) = match side {
                            Side::Source => (value, current),
                            Side::Target => (current, value),
                        };
                        let resolution = self.options.conflict.resolve(source, target);
                        tracing::debug!(
                            store = %event.store,
                            key = %key,
                            resolution = ?resolution,
                            "sync conflict resolved"
                        );
                        resolution.winner(source, target).clone()
                    }
                };
                if existing.as_ref() != Some(&winner) {
                    dest.put(winner.clone()).await?;
                }
                if &winner != value && self.writes_to(side) {
                    origin.store(&event.store)?.put(winner).await?;
                }
            }
        }
        Ok(())
    }

    async fn sync_all(&self) -> Result<SyncReport> {
        let phase = self.phase();
        if phase == Phase::Stopped {
            return Err(phase.invalid("sync"));
        }
        let mut report = SyncReport::default();
        for store in &self.options.stores {
            let stats = self.sync_store(store, &mut report.conflicts).await;
            report.stores.insert(store.clone(), stats);
        }
        Ok(report)
    }

    async fn sync_store(&self, name: &str, conflicts: &mut Vec<Conflict>) -> StoreReport {
        let mut stats = StoreReport::default();
        let sides = async {
            let source = self.source.store(name)?;
            let target = self.target.store(name)?;
            let left = records_by_key(&source).await?;
            let right = records_by_key(&target).await?;
            Ok::<_, Error>((source, target, left, right))
        };
        let (source, target, left, right) = match sides.await {
            Ok(sides) => sides,
            Err(error) => {
                stats.errors += 1;
                self.report(SyncApplyError {
                    store: name.to_string(),
                    operation: SyncOperation::Diff,
                    key: None,
                    error,
                });
                return stats;
            }
        };

        let direction = self.options.direction;
        let keys: BTreeSet<&Key> = left.keys().chain(right.keys()).collect();
        for key in keys {
            let outcome = match (left.get(key), right.get(key)) {
                (Some(value), None) if direction.pushes() => {
                    copy(&target, value, &mut stats.copied).await
                }
                (None, Some(value)) if direction.pulls() => {
                    copy(&source, value, &mut stats.copied).await
                }
                (Some(s), Some(t)) if s != t => {
                    let resolution = self.options.conflict.resolve(s, t);
                    let winner = resolution.winner(s, t).clone();
                    stats.conflicts += 1;
                    conflicts.push(Conflict {
                        store: name.to_string(),
                        key: key.clone(),
                        resolution,
                    });
                    self.write_winner(&source, &target, s, t, winner).await
                }
                _ => Ok(()),
            };
            if let Err(error) = outcome {
                stats.errors += 1;
                self.report(SyncApplyError {
                    store: name.to_string(),
                    operation: SyncOperation::Put,
                    key: Some(key.clone()),
                    error,
                });
            }
        }
        stats
    }

    async fn write_winner(
        &self,
        source: &StoreAccessor,
        target: &StoreAccessor,
        source_value: &Value,
        target_value: &Value,
        winner: Value,
    ) -> Result<()> {
        let direction = self.options.direction;
        if direction.pushes() && &winner != target_value {
            target.put(winner.clone()).await?;
        }
        if direction.pulls() && &winner != source_value {
            source.put(winner).await?;
        }
        Ok(())
    }
}

async fn copy(dest: &StoreAccessor, value: &Value, copied: &mut usize) -> Result<()> {
    dest.put(value.clone()).await?;
    *copied += 1;
    Ok(())
}

async fn records_by_key(store: &StoreAccessor) -> Result<BTreeMap<Key, Value>> {
    let schema = store.schema();
    Ok(store
        .get_all(ScanOptions::default())
        .await?
        .into_iter()
        .filter_map(|record| schema.key_of(&record).map(|key| (key, record)))
        .collect())
}
