use chrono::{Local, Utc};
use futures_util::future::join_all;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::error::SyncError;
use super::snapshot::{Selection, Snapshot};
use crate::backend::Backend;
use crate::connection::{Connector, ConnectionManager, Handler, InboundMessage};
use crate::filter::Filter;
use crate::model::TrackedObject;
use crate::path;
use crate::resolve::{resolve, ResolvedPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub tick: Duration,
    pub path_window_minutes: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            path_window_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickKind {
    /// Only the followed object was refreshed.
    Followed(String),
    /// The whole filtered set was refetched.
    Full,
    /// The selection or filter changed while the fetch was in flight; the
    /// result was dropped.
    Discarded,
}

struct Core<B> {
    backend: B,
    settings: SyncSettings,
    state: watch::Sender<Arc<Snapshot>>,
    wake: Notify,
}

#[derive(Debug)]
struct WorkerHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Keeps the tracked-object snapshot in step with the backend on a fixed
/// cadence. Ticks never overlap: the next one starts after the previous
/// one has been merged.
pub struct SyncScheduler<B: Backend> {
    core: Arc<Core<B>>,
    worker: Option<WorkerHandle>,
}

impl<B: Backend> SyncScheduler<B> {
    pub fn new(backend: B, settings: SyncSettings, filter: Filter) -> Self {
        let (state, _) = watch::channel(Arc::new(Snapshot::new(filter)));
        Self {
            core: Arc::new(Core {
                backend,
                settings,
                state,
                wake: Notify::new(),
            }),
            worker: None,
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.core.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.core.state.subscribe()
    }

    /// Fetches the type registry used for marker icons.
    pub async fn load_types(&self) -> Result<(), SyncError> {
        let types = self.core.backend.object_types().await?;
        log::debug!("loaded {} object types", types.len());
        self.core.update(|s| Snapshot {
            types: Arc::new(types),
            ..s.clone()
        });
        Ok(())
    }

    /// Runs a single refresh now.
    pub async fn tick(&self) -> Result<TickKind, SyncError> {
        self.core.tick().await
    }

    pub fn start(&mut self) -> Result<(), SyncError> {
        if self.worker.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(run_sync_loop(self.core.clone(), stop_rx));
        self.worker = Some(WorkerHandle { stop_tx, join });
        log::info!("sync started, every {:?}", self.core.settings.tick);
        Ok(())
    }

    /// Stops the cadence. A fetch in flight is dropped, never merged.
    pub async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.join.await;
            log::info!("sync stopped");
        }
    }

    /// Runs the next tick immediately instead of waiting for the cadence.
    pub fn wake(&self) {
        self.core.wake.notify_one();
    }

    /// Re-applies the pipeline to what is already loaded and refetches on
    /// the next tick.
    pub fn set_filter(&self, filter: Filter) {
        self.core.update(|s| s.with_filter(filter, &Local::now()));
        self.wake();
    }

    pub fn toggle_follow(&self, id: &str) -> Selection {
        let mut selection = Selection::Unknown;
        self.core.update(|s| {
            let (next, sel) = s.with_toggled_follow(id);
            selection = sel;
            next
        });
        if matches!(selection, Selection::Followed(_)) {
            self.wake();
        }
        selection
    }

    pub fn toggle_type(&self, kind: &str) {
        self.core.update(|s| s.with_toggled_type(kind));
    }

    pub fn open_details(&self, id: &str) {
        self.core.update(|s| s.with_details(Some(id)));
    }

    pub fn close_details(&self) {
        self.core.update(|s| s.with_details(None));
    }

    /// Wakes the loop on `object_update` pushes that concern what is on
    /// screen. The handler holds the scheduler weakly, so it goes inert once
    /// the scheduler is dropped.
    pub fn attach_feed<C: Connector>(&self, feed: &ConnectionManager<C>) -> Handler {
        let core: Weak<Core<B>> = Arc::downgrade(&self.core);
        let handler: Handler = Arc::new(move |message: &InboundMessage| {
            let InboundMessage::ObjectUpdate { object_id, .. } = message else {
                return;
            };
            let Some(core) = core.upgrade() else {
                return;
            };
            let relevant = match &core.snapshot().followed {
                Some(followed) => followed == object_id,
                None => true,
            };
            if relevant {
                core.wake.notify_one();
            }
        });
        feed.subscribe("object_update", handler.clone());
        handler
    }
}

impl<B: Backend> Core<B> {
    fn snapshot(&self) -> Arc<Snapshot> {
        self.state.borrow().clone()
    }

    fn update<F: FnOnce(&Snapshot) -> Snapshot>(&self, f: F) {
        self.state.send_modify(|current| {
            *current = Arc::new(f(current));
        });
    }

    /// Merges a tick result unless the epoch moved on since it started.
    fn commit<F: FnOnce(&Snapshot) -> Snapshot>(&self, epoch: u64, f: F) -> bool {
        self.state.send_if_modified(|current| {
            if current.epoch != epoch {
                return false;
            }
            let mut next = f(current);
            next.last_refresh = Some(Utc::now());
            next.last_error = None;
            *current = Arc::new(next);
            true
        })
    }

    async fn tick(&self) -> Result<TickKind, SyncError> {
        let start = self.snapshot();
        let result = match &start.followed {
            Some(id) => self.refresh_followed(&start, id).await,
            None => self.refresh_all(&start).await,
        };

        if let Err(e) = &result {
            let message = e.to_string();
            self.state.send_if_modified(|current| {
                if current.epoch != start.epoch {
                    return false;
                }
                *current = Arc::new(Snapshot {
                    last_error: Some(message),
                    ..(**current).clone()
                });
                true
            });
        }
        result
    }

    async fn refresh_followed(&self, start: &Snapshot, id: &str) -> Result<TickKind, SyncError> {
        let window = self.settings.path_window_minutes;
        let (latest, history) = tokio::join!(
            self.backend.sensor_data(id, None),
            self.backend.sensor_data(id, Some(window)),
        );

        let position = resolve(&latest?);
        let path = match history {
            Ok(readings) => Some(path::sample(&readings, window)),
            Err(e) => {
                log::warn!("path refresh for {} failed: {}", id, e);
                None
            }
        };

        let committed = self.commit(start.epoch, |s| s.with_followed_update(id, position, path));
        Ok(if committed {
            TickKind::Followed(id.to_string())
        } else {
            TickKind::Discarded
        })
    }

    async fn refresh_all(&self, start: &Snapshot) -> Result<TickKind, SyncError> {
        let objects = self.backend.list_objects(&start.filter).await?;
        let fetched = join_all(objects.into_iter().map(|object| self.locate(object))).await;
        let count = fetched.len();

        let committed = self.commit(start.epoch, |s| s.with_full_refresh(fetched, &Local::now()));
        if committed {
            log::debug!("refreshed {} objects", count);
        }
        Ok(if committed {
            TickKind::Full
        } else {
            TickKind::Discarded
        })
    }

    async fn locate(&self, object: TrackedObject) -> (TrackedObject, Option<ResolvedPosition>) {
        match self.backend.sensor_data(&object.id, None).await {
            Ok(readings) => {
                let position = resolve(&readings);
                (object, position)
            }
            Err(e) => {
                log::warn!("position lookup for {} failed: {}", object.id, e);
                (object, None)
            }
        }
    }
}

async fn run_sync_loop<B: Backend>(core: Arc<Core<B>>, mut stop_rx: oneshot::Receiver<()>) {
    let period = core.settings.tick;
    // after a refresh done before start() the first tick is a full period away
    let first = if core.snapshot().last_refresh.is_some() {
        Instant::now() + period
    } else {
        Instant::now()
    };
    let mut interval = tokio::time::interval_at(first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let should_stop = tokio::select! {
            _ = interval.tick() => false,
            _ = core.wake.notified() => false,
            _ = &mut stop_rx => true,
        };
        if should_stop {
            return;
        }

        let outcome = tokio::select! {
            result = core.tick() => Some(result),
            _ = &mut stop_rx => None,
        };
        match outcome {
            None => return,
            Some(Ok(kind)) => log::debug!("tick done: {:?}", kind),
            Some(Err(e)) => log::warn!("refresh failed, retrying next tick: {}", e),
        }
    }
}
