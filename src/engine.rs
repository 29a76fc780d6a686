//! Single-owner driver for the forest. Live readings, timer ticks, backfill
//! results and rebuilds all arrive as `EngineEvent`s and are applied one at a
//! time on one task, so the live path and the backfill path never interleave
//! partial writes.

use crate::attribution;
use crate::config::EngineConfig;
use crate::error::{AppError, Result};
use crate::history::backfill;
use crate::history::resample::BucketWindow;
use crate::history::rolling;
use crate::host::{HistoryBatch, HistorySource, LiveStateSource, LiveStates, SensorUnits};
use crate::tree::Node;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

pub type ForestSnapshot = Arc<Vec<Node>>;

#[derive(Debug)]
pub enum EngineEvent {
    /// A timer period elapsed; `None` when the live states could not be read.
    Tick(Option<LiveStates>),
    /// Pushed live update between ticks.
    States(LiveStates),
    RequestBackfill,
    HistoryLoaded {
        generation: u64,
        window: BucketWindow,
        result: Result<HistoryBatch>,
    },
    /// Replace the whole forest, e.g. after reconfiguration.
    Rebuild(Vec<Node>),
}

/// Side effect the runtime has to carry out after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    FetchHistory {
        generation: u64,
        window: BucketWindow,
        sensors: BTreeSet<String>,
    },
}

/// The forest plus the one update function that mutates it.
#[derive(Debug)]
pub struct Engine {
    forest: Vec<Node>,
    config: Arc<EngineConfig>,
    units: SensorUnits,
    generation: u64,
    ticks: u64,
}

impl Engine {
    pub fn new(forest: Vec<Node>, config: Arc<EngineConfig>) -> Self {
        Self {
            forest,
            config,
            units: SensorUnits::new(),
            generation: 0,
            ticks: 0,
        }
    }

    pub fn forest(&self) -> &[Node] {
        &self.forest
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn backfill_request(&self, now: f64) -> Effect {
        Effect::FetchHistory {
            generation: self.generation,
            window: BucketWindow::new(
                self.config.history_buckets,
                self.config.bucket_seconds(),
                now,
            ),
            sensors: backfill::sensor_ids(&self.forest),
        }
    }

    pub fn handle(&mut self, event: EngineEvent, now: f64) -> Option<Effect> {
        let capacity = self.config.history_buckets;
        match event {
            EngineEvent::Tick(states) => {
                rolling::advance(&mut self.forest, capacity);
                match states {
                    Some(states) => {
                        self.units.extend(states.units());
                        rolling::record(&mut self.forest, &states, capacity);
                    }
                    None => warn!("live states unavailable, carrying values forward"),
                }
                attribution::attribute(&mut self.forest);
                self.ticks += 1;
                debug!(tick = self.ticks, roots = self.forest.len(), "tick applied");
                None
            }
            EngineEvent::States(states) => {
                self.units.extend(states.units());
                rolling::record(&mut self.forest, &states, capacity);
                attribution::attribute(&mut self.forest);
                None
            }
            EngineEvent::RequestBackfill => Some(self.backfill_request(now)),
            EngineEvent::HistoryLoaded {
                generation,
                window,
                result,
            } => {
                if generation != self.generation {
                    debug!(
                        generation,
                        current = self.generation,
                        "dropping history for a replaced forest"
                    );
                    return None;
                }
                match result {
                    Ok(batch) => backfill::apply(&mut self.forest, &batch, &window, &self.units),
                    Err(e) => warn!(error = %e, "history fetch failed, keeping live history"),
                }
                None
            }
            EngineEvent::Rebuild(forest) => {
                self.forest = forest;
                self.generation += 1;
                info!(
                    generation = self.generation,
                    roots = self.forest.len(),
                    "forest replaced"
                );
                Some(self.backfill_request(now))
            }
        }
    }
}

pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1_000.0
}

/// Owner side of a running engine. Dropping it stops the timer and any
/// pending history fetch.
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    snapshots: watch::Receiver<ForestSnapshot>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn send(&self, event: EngineEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| AppError::Engine("engine stopped".to_string()))
    }

    pub fn subscribe(&self) -> watch::Receiver<ForestSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> ForestSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Engine {
    /// Start the engine loop: ticks every bucket duration, runs an initial
    /// backfill and serves events until shut down.
    pub fn spawn<L, H>(
        forest: Vec<Node>,
        config: Arc<EngineConfig>,
        live: Arc<L>,
        history: Arc<H>,
    ) -> EngineHandle
    where
        L: LiveStateSource,
        H: HistorySource,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(forest.clone()));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let engine = Engine::new(forest, config);
        let task = tokio::spawn(run(engine, live, history, rx, snapshot_tx, shutdown_rx));

        EngineHandle {
            tx,
            snapshots,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

async fn run<L, H>(
    mut engine: Engine,
    live: Arc<L>,
    history: Arc<H>,
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    snapshot_tx: watch::Sender<ForestSnapshot>,
    mut shutdown_rx: oneshot::Receiver<()>,
) where
    L: LiveStateSource,
    H: HistorySource,
{
    let period = engine.config.bucket_duration;
    info!(
        period_secs = period.as_secs_f64(),
        buckets = engine.config.history_buckets,
        "power engine started"
    );

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    let mut fetches: JoinSet<EngineEvent> = JoinSet::new();

    let first_read = tokio::select! {
        biased;
        _ = &mut shutdown_rx => {
            info!("power engine stopped");
            return;
        }
        states = read_states(live.as_ref(), period) => states,
    };
    if let Some(states) = first_read {
        engine.handle(EngineEvent::States(states), now_epoch());
    }
    let initial = engine.backfill_request(now_epoch());
    start_fetch(&mut fetches, &history, initial);
    publish(&snapshot_tx, &engine);

    loop {
        let event = tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            Some(event) = rx.recv() => event,
            Some(done) = fetches.join_next(), if !fetches.is_empty() => match done {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "history fetch task failed");
                    continue;
                }
            },
            _ = ticker.tick() => {
                let states = tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    states = read_states(live.as_ref(), period) => states,
                };
                EngineEvent::Tick(states)
            }
        };

        if let Some(effect) = engine.handle(event, now_epoch()) {
            start_fetch(&mut fetches, &history, effect);
        }
        publish(&snapshot_tx, &engine);
    }

    fetches.abort_all();
    info!("power engine stopped");
}

/// One live read, given up after `limit` so a stalled host cannot hold the
/// loop past a tick period.
async fn read_states<L: LiveStateSource>(live: &L, limit: Duration) -> Option<LiveStates> {
    match timeout(limit, live.fetch_states()).await {
        Ok(Ok(states)) => Some(states),
        Ok(Err(e)) => {
            warn!(error = %e, "failed to read live states");
            None
        }
        Err(_) => {
            warn!(limit_secs = limit.as_secs_f64(), "live state read timed out");
            None
        }
    }
}

fn start_fetch<H: HistorySource>(fetches: &mut JoinSet<EngineEvent>, history: &Arc<H>, effect: Effect) {
    let Effect::FetchHistory {
        generation,
        window,
        sensors,
    } = effect;
    let history = Arc::clone(history);
    fetches.spawn(async move {
        let result = backfill::fetch(history.as_ref(), &sensors, &window).await;
        EngineEvent::HistoryLoaded {
            generation,
            window,
            result,
        }
    });
}

fn publish(snapshot_tx: &watch::Sender<ForestSnapshot>, engine: &Engine) {
    snapshot_tx.send_replace(Arc::new(engine.forest().to_vec()));
}
