//! Read-only view of connection state for front ends.

use super::config::{ConnectionState, VpnGroup, VpnProfile};
use super::supervisor::{ProfileStatus, SupervisorEvent};
use crate::events::{self, EventEmitter};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Short text shown next to a profile.
pub fn status_line(status: &ProfileStatus) -> String {
  match (&status.state, &status.last_error) {
    (ConnectionState::Error, Some(reason)) => format!("Error: {reason}"),
    (state, _) => state.to_string(),
  }
}

/// Operator notification for a transition, if it deserves one.
pub fn notification(event: &SupervisorEvent) -> Option<String> {
  let name = &event.profile;
  match (event.previous, event.state) {
    (_, ConnectionState::Connected) => Some(format!("VPN {name} is connected")),
    (previous, ConnectionState::Disconnected) if previous.is_active() => {
      Some(format!("VPN {name} is disconnected"))
    }
    (_, ConnectionState::Error) => Some(format!(
      "VPN {name} failed: {}",
      event.detail.as_deref().unwrap_or("unknown error")
    )),
    _ => None,
  }
}

fn rank(state: ConnectionState) -> u8 {
  match state {
    ConnectionState::Disconnected => 0,
    ConnectionState::Error => 1,
    ConnectionState::Connecting => 2,
    ConnectionState::Connected => 3,
  }
}

/// Group state: the most active member wins
/// (Connected > Connecting > Error > Disconnected).
pub fn aggregate<I>(states: I) -> ConnectionState
where
  I: IntoIterator<Item = ConnectionState>,
{
  states
    .into_iter()
    .max_by_key(|s| rank(*s))
    .unwrap_or_default()
}

pub fn group_state(group: &VpnGroup, statuses: &[ProfileStatus]) -> ConnectionState {
  aggregate(group.members.iter().map(|member| state_in(statuses, member)))
}

fn state_in(statuses: &[ProfileStatus], name: &str) -> ConnectionState {
  statuses
    .iter()
    .find(|s| s.name == name)
    .map(|s| s.state)
    .unwrap_or_default()
}

/// Rows for `status` / `list`: profiles first, then groups.
pub fn format_overview(
  profiles: &[VpnProfile],
  groups: &[VpnGroup],
  statuses: &[ProfileStatus],
) -> Vec<String> {
  let mut rows = Vec::new();

  for profile in profiles {
    let status = statuses
      .iter()
      .find(|s| s.name == profile.name)
      .cloned()
      .unwrap_or_else(|| ProfileStatus {
        name: profile.name.clone(),
        state: ConnectionState::Disconnected,
        since: chrono::Utc::now(),
        pid: None,
        last_error: None,
      });
    let scope = if profile.is_global() { "global" } else { "local" };
    rows.push(format!(
      "{:<24} {:<7} {}:{:<6} {}",
      profile.name,
      scope,
      profile.gateway_host,
      profile.gateway_port,
      status_line(&status)
    ));
  }

  for group in groups {
    rows.push(format!(
      "{:<24} {:<7} [{}] {}",
      group.name,
      "group",
      group.members.join(", "),
      group_state(group, statuses)
    ));
  }

  rows
}

/// Forwards supervisor events to an emitter. Never touches the supervisor.
pub struct StatusReporter {
  emitter: Arc<dyn EventEmitter>,
}

impl StatusReporter {
  pub fn new(emitter: Arc<dyn EventEmitter>) -> Self {
    Self { emitter }
  }

  pub fn report(&self, event: &SupervisorEvent) {
    if let Err(e) = events::emit(self.emitter.as_ref(), events::STATE_CHANGED, event) {
      log::warn!("[status] Failed to emit state change: {e}");
    }
    if let Some(message) = notification(event) {
      if let Err(e) = events::emit(self.emitter.as_ref(), events::NOTIFICATION, message) {
        log::warn!("[status] Failed to emit notification: {e}");
      }
    }
  }

  /// Report every event until the supervisor goes away.
  pub fn spawn(self, mut rx: broadcast::Receiver<SupervisorEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(event) => self.report(&event),
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            log::warn!("[status] Missed {missed} state changes");
          }
          Err(broadcast::error::RecvError::Closed) => break,
        }
      }
    })
  }
}
