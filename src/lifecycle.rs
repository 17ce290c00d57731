//! Startup, background reconciliation and teardown.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::app::App;
use crate::event::{Event, EventHandler, HostMessage, SyncEvent};

/// Owns the tick timer, the connectivity listener and every spawned run.
pub struct LifecycleController {
  app: Arc<App>,
  events: EventHandler,
  listener: JoinHandle<()>,
  runs: JoinSet<()>,
  offline_ticks: u32,
}

impl LifecycleController {
  /// Bring the sync core up: recover interrupted items, warm the cache,
  /// bootstrap reference data if needed, and start the timer.
  pub async fn init(app: Arc<App>) -> Result<Self> {
    app.queue().recover_in_flight()?;

    let events = EventHandler::new(app.config().tick_interval());
    let listener = spawn_connectivity_listener(&app, events.sender());

    let proxy = app.proxy();
    match proxy.install().await {
      Ok(_) if app.config().cache.auto_activate => {
        proxy.activate()?;
      }
      Ok(_) => debug!("new cache generation installed, waiting for activation"),
      Err(e) => warn!("cache install failed: {}", e),
    }

    if app.is_online() {
      let report = app.download_essential_data(false).await?;
      if !report.success {
        warn!(errors = report.errors.len(), "reference data incomplete");
      }
    }

    let mut controller = Self {
      app,
      events,
      listener,
      runs: JoinSet::new(),
      offline_ticks: 0,
    };
    // Flush anything queued before the last shutdown
    controller.spawn_sync();
    info!("sync core started");
    Ok(controller)
  }

  /// Sender for host messages and manual events.
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.events.sender()
  }

  /// Process events until `Shutdown` arrives.
  pub async fn run(&mut self) -> Result<()> {
    while let Some(event) = self.events.next().await {
      if !self.handle(event).await? {
        break;
      }
    }
    Ok(())
  }

  /// Stop the timer and listeners, then wait for in-flight runs.
  pub async fn shutdown(mut self) {
    self.events.stop();
    self.listener.abort();
    let mut finished = 0;
    while let Some(result) = self.runs.join_next().await {
      if let Err(e) = result {
        warn!("sync run ended abnormally: {}", e);
      }
      finished += 1;
    }
    info!(finished, "sync core stopped");
  }

  /// Returns false when the loop should stop.
  async fn handle(&mut self, event: Event) -> Result<bool> {
    while self.runs.try_join_next().is_some() {}

    match event {
      Event::Tick => {
        if self.app.is_online() {
          self.offline_ticks = 0;
          self.spawn_sync();
        } else {
          self.offline_ticks += 1;
          if self.offline_ticks >= self.app.config().sync.offline_probe_ticks.max(1) {
            // A successful run flips the flag back on
            self.offline_ticks = 0;
            debug!("probing remote while offline");
            self.spawn_sync();
          }
        }
      }
      Event::ConnectivityChanged(true) => {
        info!("back online, reconciling");
        self.spawn_sync();
      }
      Event::ConnectivityChanged(false) => {}
      Event::Host(message) => {
        // Control messages are fire-and-forget
        if let Err(e) = self.handle_host(message).await {
          warn!("host message failed: {}", e);
        }
      }
      Event::Shutdown => return Ok(false),
    }
    Ok(true)
  }

  async fn handle_host(&mut self, message: HostMessage) -> Result<()> {
    let proxy = self.app.proxy();
    match message {
      HostMessage::ActivateGeneration => {
        proxy.activate()?;
      }
      HostMessage::PurgeCaches(class) => {
        proxy.purge(class)?;
      }
      HostMessage::Evict { class, key } => {
        let removed = proxy.evict(class, &key)?;
        debug!(%class, key, removed, "evict requested");
      }
      HostMessage::ReportStatus(reply) => {
        let status = self.app.cache_status()?;
        // The requester may have given up waiting
        let _ = reply.send(status);
      }
      HostMessage::ForceSync => self.spawn_sync(),
    }
    Ok(())
  }

  fn spawn_sync(&mut self) {
    let engine = self.app.engine();
    self.runs.spawn(async move {
      let _ = engine.trigger().await;
    });
  }
}

/// Forward connectivity announcements from the bus into the controller loop.
fn spawn_connectivity_listener(app: &App, tx: mpsc::UnboundedSender<Event>) -> JoinHandle<()> {
  let mut rx = app.subscribe();
  tokio::spawn(async move {
    loop {
      match rx.recv().await {
        Ok(SyncEvent::ConnectivityChanged(online)) => {
          if tx.send(Event::ConnectivityChanged(online)).is_err() {
            break;
          }
        }
        Ok(_) => {}
        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
          debug!(skipped, "connectivity listener lagged");
        }
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      }
    }
  })
}
