//! Online/offline tracking.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Something that can tell whether the backend is reachable right now.
pub trait ConnectivityProbe: Send + Sync {
  fn is_reachable(&self) -> impl Future<Output = bool> + Send;
}

/// Shared online flag.
///
/// Cloning gives another handle onto the same flag. Receivers from
/// [`Connectivity::subscribe`] only wake on actual transitions.
#[derive(Clone, Debug)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the current state. Returns `true` if this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    })
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(false)
  }
}

/// Poll `probe` every `every` and feed the result into `connectivity`.
pub fn spawn_probe<P>(probe: Arc<P>, connectivity: Connectivity, every: Duration) -> JoinHandle<()>
where
  P: ConnectivityProbe + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      ticker.tick().await;
      let online = probe.is_reachable().await;
      if connectivity.set_online(online) {
        tracing::info!(online, "connectivity changed");
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct Switch(AtomicBool);

  impl ConnectivityProbe for Switch {
    async fn is_reachable(&self) -> bool {
      self.0.load(Ordering::SeqCst)
    }
  }

  #[test]
  fn test_set_online_reports_transitions_only() {
    let connectivity = Connectivity::new(false);
    assert!(!connectivity.set_online(false));
    assert!(connectivity.set_online(true));
    assert!(!connectivity.set_online(true));
    assert!(connectivity.is_online());
  }

  #[tokio::test]
  async fn test_subscribers_see_transitions() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
  }

  #[tokio::test]
  async fn test_probe_feeds_connectivity() {
    let probe = Arc::new(Switch(AtomicBool::new(true)));
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    let task = spawn_probe(
      Arc::clone(&probe),
      connectivity.clone(),
      Duration::from_millis(10),
    );
    tokio::time::timeout(Duration::from_secs(2), rx.changed())
      .await
      .unwrap()
      .unwrap();
    assert!(connectivity.is_online());

    probe.0.store(false, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(2), rx.changed())
      .await
      .unwrap()
      .unwrap();
    assert!(!connectivity.is_online());
    task.abort();
  }
}
