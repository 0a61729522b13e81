//! Connection supervisor.
//!
//! Owns the single active worker and the per-profile connection states.
//! Every state change is published as a [`SupervisorEvent`].

use super::config::{ConnectionState, VpnError, VpnProfile};
use super::worker::{
  build_invocation, classify_line, interpret_exit, kill_stray_workers, pppd_exit_message,
  spawn_output_reader, spawn_worker, LineKind, WorkerExit, WorkerHandle, WorkerSignal,
};
use crate::credential_cipher::CredentialCipher;
use crate::settings_manager::AppSettings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 64;
/// How long to keep reading buffered output after the worker exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
  pub worker_binary: PathBuf,
  pub elevation: Vec<String>,
  pub connect_timeout: Duration,
  pub terminate_grace: Duration,
}

impl From<&AppSettings> for SupervisorConfig {
  fn from(settings: &AppSettings) -> Self {
    Self {
      worker_binary: settings.worker_binary.clone(),
      elevation: settings.elevation.clone(),
      connect_timeout: settings.connect_timeout(),
      terminate_grace: settings.terminate_grace(),
    }
  }
}

impl Default for SupervisorConfig {
  fn default() -> Self {
    Self::from(&AppSettings::default())
  }
}

/// Current state of one profile as seen by the supervisor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileStatus {
  pub name: String,
  pub state: ConnectionState,
  pub since: DateTime<Utc>,
  pub pid: Option<u32>,
  /// Reason of the last failure, kept while the state is `Error`.
  pub last_error: Option<String>,
}

impl ProfileStatus {
  fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      state: ConnectionState::Disconnected,
      since: Utc::now(),
      pid: None,
      last_error: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorEvent {
  pub profile: String,
  pub previous: ConnectionState,
  pub state: ConnectionState,
  pub detail: Option<String>,
  pub at: DateTime<Utc>,
}

struct ActiveWorker {
  profile: String,
  generation: u64,
  cancel: CancellationToken,
  monitor: JoinHandle<()>,
}

impl ActiveWorker {
  /// Cancel the monitor and wait until it has reaped the worker.
  async fn stop(self) {
    self.cancel.cancel();
    if let Err(e) = self.monitor.await {
      log::warn!("[supervisor] Monitor for '{}' ended abnormally: {e}", self.profile);
    }
  }
}

#[derive(Default)]
struct Inner {
  states: HashMap<String, ProfileStatus>,
  active: Option<ActiveWorker>,
  next_generation: u64,
}

impl Inner {
  fn status(&self, name: &str) -> ProfileStatus {
    self
      .states
      .get(name)
      .cloned()
      .unwrap_or_else(|| ProfileStatus::new(name))
  }

  fn busy_profile(&self) -> Option<&str> {
    self
      .states
      .values()
      .find(|s| s.state.is_active())
      .map(|s| s.name.as_str())
  }

  fn is_current(&self, generation: u64) -> bool {
    self
      .active
      .as_ref()
      .is_some_and(|a| a.generation == generation)
  }
}

struct Shared {
  inner: Mutex<Inner>,
  events: broadcast::Sender<SupervisorEvent>,
}

impl Shared {
  fn transition(
    &self,
    inner: &mut Inner,
    name: &str,
    state: ConnectionState,
    detail: Option<String>,
  ) {
    let status = inner
      .states
      .entry(name.to_string())
      .or_insert_with(|| ProfileStatus::new(name));
    let previous = status.state;

    status.state = state;
    status.since = Utc::now();
    status.last_error = match state {
      ConnectionState::Error => detail.clone(),
      _ => None,
    };
    if !state.is_active() {
      status.pid = None;
    }

    match state {
      ConnectionState::Error => log::warn!(
        "[supervisor] {name}: {previous} -> {state} ({})",
        detail.as_deref().unwrap_or("no detail")
      ),
      _ => log::info!("[supervisor] {name}: {previous} -> {state}"),
    }

    // No subscribers is fine
    let _ = self.events.send(SupervisorEvent {
      profile: name.to_string(),
      previous,
      state,
      detail,
      at: Utc::now(),
    });
  }

  /// Apply a monitor update unless its attempt has been superseded.
  async fn update(&self, generation: u64, name: &str, state: ConnectionState) {
    let mut inner = self.inner.lock().await;
    if inner.is_current(generation) {
      self.transition(&mut inner, name, state, None);
    } else {
      log::debug!("[supervisor] Dropping stale update for '{name}' (attempt {generation})");
    }
  }

  /// Final update of an attempt: releases the active slot.
  async fn finish(
    &self,
    generation: u64,
    name: &str,
    state: ConnectionState,
    detail: Option<String>,
  ) {
    let mut inner = self.inner.lock().await;
    if inner.is_current(generation) {
      inner.active = None;
      self.transition(&mut inner, name, state, detail);
    } else {
      log::debug!("[supervisor] Dropping stale result for '{name}' (attempt {generation})");
    }
  }
}

/// One per process; share it through an `Arc`.
pub struct Supervisor {
  config: SupervisorConfig,
  cipher: CredentialCipher,
  shared: Arc<Shared>,
  /// Held across connect, disconnect and kill_all, so a worker being stopped
  /// is reaped before its slot can be reused.
  lifecycle: Mutex<()>,
}

impl Supervisor {
  pub fn new(config: SupervisorConfig) -> Self {
    Self::with_cipher(config, CredentialCipher::app().clone())
  }

  pub fn with_cipher(config: SupervisorConfig, cipher: CredentialCipher) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      config,
      cipher,
      shared: Arc::new(Shared {
        inner: Mutex::new(Inner::default()),
        events,
      }),
      lifecycle: Mutex::new(()),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
    self.shared.events.subscribe()
  }

  pub async fn state_of(&self, name: &str) -> ConnectionState {
    self.shared.inner.lock().await.status(name).state
  }

  pub async fn status_of(&self, name: &str) -> ProfileStatus {
    self.shared.inner.lock().await.status(name)
  }

  /// Every profile the supervisor has seen, sorted by name.
  pub async fn snapshot(&self) -> Vec<ProfileStatus> {
    let inner = self.shared.inner.lock().await;
    let mut statuses: Vec<ProfileStatus> = inner.states.values().cloned().collect();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    statuses
  }

  /// The profile currently Connecting or Connected, if any.
  pub async fn active_profile(&self) -> Option<String> {
    self
      .shared
      .inner
      .lock()
      .await
      .busy_profile()
      .map(str::to_string)
  }

  /// Fails with `ProfileBusy` while the profile has a live worker.
  pub async fn ensure_idle(&self, name: &str) -> Result<(), VpnError> {
    if self.state_of(name).await.is_active() {
      return Err(VpnError::ProfileBusy(name.to_string()));
    }
    Ok(())
  }

  /// Drop the remembered state of an idle profile after it was renamed or
  /// deleted.
  pub async fn forget(&self, name: &str) {
    let mut inner = self.shared.inner.lock().await;
    if inner
      .states
      .get(name)
      .is_some_and(|s| !s.state.is_active())
    {
      inner.states.remove(name);
    }
  }

  pub async fn connect(&self, profile: &VpnProfile, otp: Option<&str>) -> Result<(), VpnError> {
    profile.validate()?;
    if profile.otp && otp.filter(|code| !code.is_empty()).is_none() {
      return Err(VpnError::InvalidProfile(format!(
        "'{}' requires a one-time code",
        profile.name
      )));
    }

    let _lifecycle = self.lifecycle.lock().await;
    let mut inner = self.shared.inner.lock().await;
    if let Some(active) = inner.busy_profile() {
      return Err(VpnError::AlreadyActive {
        active: active.to_string(),
      });
    }

    let name = profile.name.as_str();
    inner.next_generation += 1;
    let generation = inner.next_generation;
    self
      .shared
      .transition(&mut inner, name, ConnectionState::Connecting, None);

    let password = match profile.decrypt_password(&self.cipher) {
      Ok(password) => password,
      Err(e) => {
        self.shared.transition(
          &mut inner,
          name,
          ConnectionState::Error,
          Some(format!("stored password is unreadable: {e}")),
        );
        return Err(e.into());
      }
    };

    let invocation = build_invocation(
      &self.config.worker_binary,
      &self.config.elevation,
      profile,
      &password,
      otp,
    );

    let (worker, stdout, stderr) = match spawn_worker(&invocation).await {
      Ok(spawned) => spawned,
      Err(e) => {
        self
          .shared
          .transition(&mut inner, name, ConnectionState::Error, Some(e.to_string()));
        return Err(e);
      }
    };

    if let Some(status) = inner.states.get_mut(name) {
      status.pid = Some(worker.pid);
    }

    let (tx, rx) = mpsc::channel(64);
    spawn_output_reader(stdout, tx.clone());
    spawn_output_reader(stderr, tx);

    let cancel = CancellationToken::new();
    let monitor = tokio::spawn(monitor(MonitorContext {
      shared: self.shared.clone(),
      name: name.to_string(),
      generation,
      worker,
      rx,
      cancel: cancel.clone(),
      connect_timeout: self.config.connect_timeout,
      terminate_grace: self.config.terminate_grace,
      elevated: invocation.elevated,
    }));

    inner.active = Some(ActiveWorker {
      profile: name.to_string(),
      generation,
      cancel,
      monitor,
    });

    Ok(())
  }

  /// Stop the profile's worker, or clear its error. A disconnect that waited
  /// for a concurrent stop of the same profile succeeds once that stop is done.
  pub async fn disconnect(&self, name: &str) -> Result<(), VpnError> {
    if self.state_of(name).await == ConnectionState::Disconnected {
      return Err(VpnError::NotActive(name.to_string()));
    }

    let _lifecycle = self.lifecycle.lock().await;
    let active = {
      let mut inner = self.shared.inner.lock().await;
      match inner.status(name).state {
        ConnectionState::Disconnected => return Ok(()),
        ConnectionState::Error => {
          self
            .shared
            .transition(&mut inner, name, ConnectionState::Disconnected, None);
          return Ok(());
        }
        ConnectionState::Connecting | ConnectionState::Connected => {
          if inner.active.as_ref().is_some_and(|a| a.profile == name) {
            inner.active.take()
          } else {
            None
          }
        }
      }
    };

    if let Some(active) = active {
      log::info!("[supervisor] Disconnecting '{name}'");
      active.stop().await;
    }

    let mut inner = self.shared.inner.lock().await;
    self
      .shared
      .transition(&mut inner, name, ConnectionState::Disconnected, None);
    Ok(())
  }

  /// Terminate whatever runs, sweep stray workers and reset every profile to
  /// Disconnected. Returns the number of processes that were signalled.
  pub async fn kill_all(&self) -> usize {
    let _lifecycle = self.lifecycle.lock().await;
    let active = self.shared.inner.lock().await.active.take();
    let mut terminated = 0;

    if let Some(active) = active {
      log::info!("[supervisor] Killing worker of '{}'", active.profile);
      active.stop().await;
      terminated += 1;
    }

    terminated += kill_stray_workers(&self.config.worker_binary, &self.config.elevation).await;

    let mut inner = self.shared.inner.lock().await;
    let names: Vec<String> = inner
      .states
      .values()
      .filter(|s| s.state != ConnectionState::Disconnected)
      .map(|s| s.name.clone())
      .collect();
    for name in names {
      self
        .shared
        .transition(&mut inner, &name, ConnectionState::Disconnected, None);
    }

    terminated
  }
}

// ---- monitor ----

struct MonitorContext {
  shared: Arc<Shared>,
  name: String,
  generation: u64,
  worker: WorkerHandle,
  rx: mpsc::Receiver<WorkerSignal>,
  cancel: CancellationToken,
  connect_timeout: Duration,
  terminate_grace: Duration,
  elevated: bool,
}

enum Verdict {
  Continue,
  TunnelUp,
  Fail(String),
}

/// What one attempt has learned from the worker output so far.
struct Attempt {
  name: String,
  connected: bool,
  diagnostic: Option<String>,
}

impl Attempt {
  fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      connected: false,
      diagnostic: None,
    }
  }

  fn observe(&mut self, line: &str) -> Verdict {
    let line = line.trim();
    let kind = classify_line(line);
    if kind.is_fatal() {
      return Verdict::Fail(line.to_string());
    }
    match kind {
      LineKind::TunnelUp if !self.connected => {
        self.connected = true;
        Verdict::TunnelUp
      }
      LineKind::NetworkFailure if !self.connected => Verdict::Fail(line.to_string()),
      LineKind::NetworkFailure | LineKind::Error => {
        self.diagnostic = Some(line.to_string());
        Verdict::Continue
      }
      LineKind::PppdExit(code) => {
        if let Some(message) = pppd_exit_message(code) {
          self.diagnostic = Some(format!("pppd: {message}"));
        }
        Verdict::Continue
      }
      LineKind::Progress => {
        log::info!("[supervisor] {}: {line}", self.name);
        Verdict::Continue
      }
      LineKind::TunnelUp
      | LineKind::AuthFailure
      | LineKind::PrivilegeDenied
      | LineKind::CertificateFailure
      | LineKind::Other => Verdict::Continue,
    }
  }

  /// Final state after the worker exited on its own.
  fn conclude(&self, status: ExitStatus, elevated: bool) -> (ConnectionState, Option<String>) {
    match interpret_exit(status, elevated) {
      WorkerExit::Graceful if self.connected => (ConnectionState::Disconnected, None),
      WorkerExit::Graceful => (
        ConnectionState::Error,
        Some(
          self
            .diagnostic
            .clone()
            .unwrap_or_else(|| "worker exited before the tunnel came up".to_string()),
        ),
      ),
      WorkerExit::Failed(reason) => (
        ConnectionState::Error,
        Some(match &self.diagnostic {
          Some(diagnostic) => format!("{diagnostic} ({reason})"),
          None => reason,
        }),
      ),
    }
  }
}

enum Ending {
  Exited(ExitStatus),
  Failed(String),
}

async fn monitor(ctx: MonitorContext) {
  let MonitorContext {
    shared,
    name,
    generation,
    mut worker,
    mut rx,
    cancel,
    connect_timeout,
    terminate_grace,
    elevated,
  } = ctx;

  let mut attempt = Attempt::new(&name);
  let mut open_streams = 2u8;
  let deadline = tokio::time::sleep(connect_timeout);
  tokio::pin!(deadline);

  let ending = loop {
    tokio::select! {
      biased;
      _ = cancel.cancelled() => {
        worker.terminate(terminate_grace).await;
        return;
      }
      _ = &mut deadline, if !attempt.connected => {
        break Ending::Failed(format!(
          "no tunnel within {} seconds",
          connect_timeout.as_secs()
        ));
      }
      signal = rx.recv(), if open_streams > 0 => match signal {
        Some(WorkerSignal::Line(line)) => {
          log::debug!("[worker] {name}: {line}");
          match attempt.observe(&line) {
            Verdict::Continue => {}
            Verdict::TunnelUp => {
              shared.update(generation, &name, ConnectionState::Connected).await;
            }
            Verdict::Fail(reason) => break Ending::Failed(reason),
          }
        }
        Some(WorkerSignal::ReadFailed(e)) => {
          break Ending::Failed(format!("lost worker output: {e}"));
        }
        Some(WorkerSignal::Closed) | None => open_streams = open_streams.saturating_sub(1),
      },
      status = worker.wait() => match status {
        Ok(status) => break Ending::Exited(status),
        Err(e) => break Ending::Failed(format!("could not observe worker: {e}")),
      },
    }
  };

  let (state, detail) = match ending {
    Ending::Exited(status) => {
      drain_output(&mut rx, &mut attempt, open_streams).await;
      attempt.conclude(status, elevated)
    }
    Ending::Failed(reason) => {
      worker.terminate(terminate_grace).await;
      (ConnectionState::Error, Some(reason))
    }
  };

  // A cancelled attempt is settled by whoever cancelled it.
  if cancel.is_cancelled() {
    return;
  }
  shared.finish(generation, &name, state, detail).await;
}

/// Classify output still buffered after the worker exited so the failure
/// reason is not lost.
async fn drain_output(rx: &mut mpsc::Receiver<WorkerSignal>, attempt: &mut Attempt, mut open: u8) {
  let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
    while open > 0 {
      match rx.recv().await {
        Some(WorkerSignal::Line(line)) => {
          if let Verdict::Fail(reason) = attempt.observe(&line) {
            attempt.diagnostic = Some(reason);
          }
        }
        Some(WorkerSignal::ReadFailed(_)) | Some(WorkerSignal::Closed) => open -= 1,
        None => break,
      }
    }
  })
  .await;

  if drained.is_err() {
    log::debug!("[supervisor] {}: worker output still open after exit", attempt.name);
  }
}
