//! Background coordination of connectivity, counters and drains.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::connectivity::Connectivity;
use super::engine::{SyncEngine, SyncReport};
use crate::event::{Event, EventBus};
use crate::queue::QueueStatus;
use crate::remote::RemoteBackend;
use crate::store::LocalStore;

/// Observable sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatus {
  pub is_online: bool,
  pub pending_sync_count: usize,
  pub failed_sync_count: usize,
  pub is_syncing: bool,
}

/// Timings for the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
  /// Wait after coming online before draining
  pub settle_delay: Duration,
  /// How often counters are refreshed
  pub refresh_interval: Duration,
  /// How often a remaining backlog is retried while online
  pub drain_interval: Duration,
}

impl Default for OrchestratorSettings {
  fn default() -> Self {
    Self {
      settle_delay: Duration::from_secs(2),
      refresh_interval: Duration::from_secs(5),
      drain_interval: Duration::from_secs(30),
    }
  }
}

/// Drives [`SyncEngine`] from connectivity changes, queue signals and timers.
pub struct SyncOrchestrator<S: LocalStore, R: RemoteBackend> {
  engine: Arc<SyncEngine<S, R>>,
  store: Arc<S>,
  events: EventBus,
  connectivity: Connectivity,
  status: watch::Sender<SyncStatus>,
  settings: OrchestratorSettings,
}

impl<S: LocalStore, R: RemoteBackend> SyncOrchestrator<S, R> {
  pub fn new(
    engine: Arc<SyncEngine<S, R>>,
    store: Arc<S>,
    events: EventBus,
    connectivity: Connectivity,
  ) -> Self {
    let (status, _) = watch::channel(SyncStatus {
      is_online: connectivity.is_online(),
      ..SyncStatus::default()
    });
    Self {
      engine,
      store,
      events,
      connectivity,
      status,
      settings: OrchestratorSettings::default(),
    }
  }

  pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn status(&self) -> SyncStatus {
    *self.status.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Feed a platform online/offline signal.
  pub fn set_online(&self, online: bool) {
    if self.connectivity.set_online(online) {
      tracing::info!(online, "connectivity changed");
    }
  }

  /// Re-read pending and failed counts from the store.
  pub fn refresh_counts(&self) {
    let pending = self.store.count_queue_entries(QueueStatus::Pending);
    let failed = self.store.count_queue_entries(QueueStatus::Failed);
    match (pending, failed) {
      (Ok(pending), Ok(failed)) => {
        self.status.send_if_modified(|status| {
          let changed = status.pending_sync_count != pending || status.failed_sync_count != failed;
          status.pending_sync_count = pending;
          status.failed_sync_count = failed;
          changed
        });
      }
      (Err(e), _) | (_, Err(e)) => {
        tracing::warn!(error = %e, "failed to count queue entries");
      }
    }
  }

  /// Run a drain now.
  ///
  /// Returns `None` when a drain was already in progress; the call is folded into it.
  /// A drain that synced or failed anything is followed by a reconcile signal.
  pub async fn trigger_sync(&self) -> Option<SyncReport> {
    self.status.send_modify(|status| status.is_syncing = true);
    let report = self.engine.try_process_sync_queue().await;
    let still_syncing = self.engine.is_syncing();
    self
      .status
      .send_modify(|status| status.is_syncing = still_syncing);
    self.refresh_counts();

    if let Some(report) = report.filter(|report| !report.is_empty()) {
      self.events.emit(Event::Reconcile(report));
    }
    report
  }

  /// Start the background loop.
  ///
  /// Requeues entries left mid-sync by a previous process first.
  pub fn spawn(self: Arc<Self>) -> OrchestratorHandle
  where
    S: 'static,
    R: 'static,
  {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(async move { self.run(shutdown_rx).await });
    OrchestratorHandle {
      shutdown: Some(shutdown_tx),
      task,
    }
  }

  async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
    if let Err(e) = self.engine.recover() {
      tracing::warn!(error = %e, "failed to requeue interrupted entries");
    }

    let mut events = self.events.subscribe();
    let mut online = self.connectivity.subscribe();
    let mut refresh = tokio::time::interval(self.settings.refresh_interval);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut drain = tokio::time::interval(self.settings.drain_interval);
    drain.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let settle = tokio::time::sleep(self.settings.settle_delay);
    tokio::pin!(settle);
    let mut settling = false;

    self.refresh_counts();
    tracing::info!(online = self.connectivity.is_online(), "sync orchestrator started");

    loop {
      tokio::select! {
        _ = &mut shutdown => break,
        _ = refresh.tick() => self.refresh_counts(),
        _ = drain.tick() => {
          if self.connectivity.is_online() && self.status().pending_sync_count > 0 {
            self.trigger_sync().await;
          }
        }
        () = &mut settle, if settling => {
          settling = false;
          if self.connectivity.is_online() {
            self.trigger_sync().await;
          }
        }
        changed = online.changed() => {
          if changed.is_err() {
            break;
          }
          let is_online = *online.borrow_and_update();
          self.status.send_modify(|status| status.is_online = is_online);
          self.events.emit(Event::ConnectivityChanged { online: is_online });
          settling = is_online;
          if is_online {
            settle.as_mut().reset(Instant::now() + self.settings.settle_delay);
          }
        }
        event = events.recv() => match event {
          Ok(Event::MutationEnqueued { .. }) | Err(RecvError::Lagged(_)) => self.refresh_counts(),
          Ok(_) => {}
          Err(RecvError::Closed) => break,
        },
      }
    }

    tracing::info!("sync orchestrator stopped");
  }
}

/// Handle to a running orchestrator loop.
pub struct OrchestratorHandle {
  shutdown: Option<oneshot::Sender<()>>,
  task: JoinHandle<()>,
}

impl OrchestratorHandle {
  /// Stop the loop and wait for it to exit. A drain in progress finishes first.
  pub async fn shutdown(mut self) {
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(());
    }
    if let Err(e) = (&mut self.task).await {
      tracing::warn!(error = %e, "sync orchestrator task ended abnormally");
    }
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}
