use std::time::Duration;
use tokio::sync::mpsc;

/// Application events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Periodic tick, treated as a window refocus
  Tick,
  /// Ctrl-C
  Quit,
}

/// Event handler that produces events from Ctrl-C and a tick timer
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(tick_rate);
      // The first tick fires immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Quit);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
