use tokio::sync::broadcast;

use crate::sync::SyncReport;

/// Process-local events. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// A mutation was appended to the queue; counters should refresh
  MutationEnqueued { id: i64, table: String },
  /// A drain finished; consumers should refetch canonical state
  Reconcile(SyncReport),
  /// Connectivity flipped
  ConnectivityChanged { online: bool },
}

/// Fan-out bus for [`Event`]s.
///
/// Emitting never blocks and never fails: with no subscribers the event is dropped, and
/// lagging subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<Event>,
}

impl EventBus {
  /// Create a new bus buffering up to `capacity` events per subscriber
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn emit(&self, event: Event) {
    let _ = self.tx.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.tx.subscribe()
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(256)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_receive_events_in_order() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();

    bus.emit(Event::ConnectivityChanged { online: false });
    bus.emit(Event::MutationEnqueued {
      id: 1,
      table: "orders".to_string(),
    });

    assert_eq!(
      rx.recv().await.unwrap(),
      Event::ConnectivityChanged { online: false }
    );
    assert!(matches!(
      rx.recv().await.unwrap(),
      Event::MutationEnqueued { id: 1, .. }
    ));
  }

  #[test]
  fn test_emit_without_subscribers_is_silent() {
    let bus = EventBus::default();
    bus.emit(Event::ConnectivityChanged { online: true });
  }
}
