use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::proxy::{CacheClass, CacheStatus};
use crate::store::TableKind;
use crate::sync::{SyncPhase, SyncSession};

/// Inputs driving the lifecycle controller
#[derive(Debug)]
pub enum Event {
  /// Network reachability flipped
  ConnectivityChanged(bool),
  /// Periodic tick for background reconciliation
  Tick,
  /// Control message from the host shell
  Host(HostMessage),
  /// Stop the controller loop
  Shutdown,
}

/// Control messages used by update-available flows and diagnostics.
#[derive(Debug)]
pub enum HostMessage {
  /// Drop every cache generation except the current one
  ActivateGeneration,
  /// Purge one class, or everything when `None`
  PurgeCaches(Option<CacheClass>),
  Evict { class: CacheClass, key: String },
  ReportStatus(oneshot::Sender<CacheStatus>),
  /// Reconcile now, regardless of the timer
  ForceSync,
}

/// Notifications published to the UI layer
#[derive(Debug, Clone)]
pub enum SyncEvent {
  SyncComplete(SyncSession),
  SyncError {
    message: String,
    session: Option<SyncSession>,
  },
  Progress {
    phase: SyncPhase,
    table: TableKind,
    count: usize,
  },
  CacheStatus(CacheStatus),
  ConnectivityChanged(bool),
}

/// Event handler that produces controller events from a tick timer and
/// whatever the host or listeners send in
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
  ticker: JoinHandle<()>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn tick timer
    let tick_tx = tx.clone();
    let ticker = tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      // The first tick fires immediately; init already reconciles
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx, ticker }
  }

  /// Sender for posting events into the loop
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }

  /// Stop producing ticks
  pub fn stop(&self) {
    self.ticker.abort();
  }
}

/// Fan-out of `SyncEvent`s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  pub fn publish(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}

/// Process-wide online flag. Changes are announced on the bus.
pub struct Connectivity {
  online: AtomicBool,
  bus: EventBus,
}

impl Connectivity {
  pub fn new(online: bool, bus: EventBus) -> Self {
    Self {
      online: AtomicBool::new(online),
      bus,
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Returns true if the flag actually changed.
  pub fn set(&self, online: bool) -> bool {
    let changed = self.online.swap(online, Ordering::SeqCst) != online;
    if changed {
      tracing::info!(online, "connectivity changed");
      self.bus.publish(SyncEvent::ConnectivityChanged(online));
    }
    changed
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_connectivity_announces_changes_once() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let connectivity = Connectivity::new(true, bus);

    assert!(!connectivity.set(true));
    assert!(connectivity.set(false));
    assert!(!connectivity.set(false));
    assert!(!connectivity.is_online());

    match rx.try_recv() {
      Ok(SyncEvent::ConnectivityChanged(false)) => {}
      other => panic!("unexpected event: {:?}", other),
    }
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn test_event_handler_ticks_and_forwards() {
    let mut handler = EventHandler::new(Duration::from_millis(10));
    handler
      .sender()
      .send(Event::ConnectivityChanged(true))
      .unwrap();

    assert!(matches!(
      handler.next().await,
      Some(Event::ConnectivityChanged(true))
    ));
    assert!(matches!(handler.next().await, Some(Event::Tick)));
    handler.stop();
  }
}
