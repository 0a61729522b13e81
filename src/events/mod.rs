use serde::Serialize;
use tokio::sync::broadcast;

pub const STATE_CHANGED: &str = "vpn-state-changed";
pub const NOTIFICATION: &str = "vpn-notification";
/// A second launch asked the running instance to come to the front.
pub const RAISE: &str = "instance-raise";

/// Sink for events aimed at whatever front end is attached.
///
/// Uses `serde_json::Value` to stay dyn-compatible; [`emit`] accepts any
/// `Serialize` payload.
pub trait EventEmitter: Send + Sync {
  fn emit_value(&self, event: &str, payload: serde_json::Value) -> Result<(), String>;
}

pub fn emit<S: Serialize>(emitter: &dyn EventEmitter, event: &str, payload: S) -> Result<(), String> {
  let value = serde_json::to_value(payload).map_err(|e| e.to_string())?;
  emitter.emit_value(event, value)
}

/// Writes every event to the log. Used by the headless `run` mode.
#[derive(Clone, Default)]
pub struct LogEmitter;

impl EventEmitter for LogEmitter {
  fn emit_value(&self, event: &str, payload: serde_json::Value) -> Result<(), String> {
    match (event, payload.as_str()) {
      (NOTIFICATION, Some(message)) => log::info!("[notify] {message}"),
      _ => log::debug!("[event] {event}: {payload}"),
    }
    Ok(())
  }
}

/// Event message sent through a [`BroadcastEmitter`].
#[derive(Clone, Debug)]
pub struct AppEvent {
  pub event_type: String,
  pub payload: serde_json::Value,
}

/// Fans events out to every subscribed receiver.
#[derive(Clone)]
pub struct BroadcastEmitter {
  tx: broadcast::Sender<AppEvent>,
}

impl BroadcastEmitter {
  pub fn new(tx: broadcast::Sender<AppEvent>) -> Self {
    Self { tx }
  }

  pub fn with_capacity(capacity: usize) -> (Self, broadcast::Receiver<AppEvent>) {
    let (tx, rx) = broadcast::channel(capacity);
    (Self { tx }, rx)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
    self.tx.subscribe()
  }
}

impl EventEmitter for BroadcastEmitter {
  fn emit_value(&self, event: &str, payload: serde_json::Value) -> Result<(), String> {
    // Nobody listening is not an error
    let _ = self.tx.send(AppEvent {
      event_type: event.to_string(),
      payload,
    });
    Ok(())
  }
}
