//! One supervising process per user.
//!
//! The first process claims a system-wide lock and listens on a control
//! socket. Later invocations either ask it to come to the front (`Raise`) or
//! hand it a dispatcher command, then exit.

use crate::dispatcher::{Command, CommandOutcome, Dispatcher};
use crate::events::{self, EventEmitter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ::single_instance::SingleInstance;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AppError {
  #[error("This application is already running, exiting now.")]
  AlreadyRunning,
  #[error("Instance lock error: {0}")]
  Lock(String),
  #[error("Control socket error: {0}")]
  Ipc(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ControlRequest {
  Raise,
  Dispatch { command: Command },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
  Raised,
  Ok { outcome: CommandOutcome },
  Error { message: String },
}

/// Held for the lifetime of the supervising process.
pub struct InstanceGuard {
  _lock: SingleInstance,
}

impl InstanceGuard {
  /// Claim the instance lock. When another process holds it, ask that process
  /// to raise itself and fail with `AlreadyRunning`.
  pub async fn acquire(lock_name: &str, socket_path: &Path) -> Result<Self, AppError> {
    let lock = SingleInstance::new(lock_name).map_err(|e| AppError::Lock(e.to_string()))?;
    if lock.is_single() {
      log::info!("[instance] Acquired instance lock '{lock_name}'");
      return Ok(Self { _lock: lock });
    }

    log::info!("[instance] Another instance holds '{lock_name}', asking it to raise");
    match send_request(socket_path, &ControlRequest::Raise).await {
      Ok(_) => {}
      Err(e) => log::warn!("[instance] Could not reach the running instance: {e}"),
    }
    Err(AppError::AlreadyRunning)
  }
}

/// What the running instance does with control requests.
#[async_trait]
pub trait ControlHandler: Send + Sync {
  async fn dispatch(&self, command: Command) -> Result<CommandOutcome, String>;

  fn raise(&self);
}

/// Routes requests into a [`Dispatcher`] and announces raises on an emitter.
pub struct DispatchHandler {
  dispatcher: Arc<Dispatcher>,
  emitter: Arc<dyn EventEmitter>,
}

impl DispatchHandler {
  pub fn new(dispatcher: Arc<Dispatcher>, emitter: Arc<dyn EventEmitter>) -> Self {
    Self {
      dispatcher,
      emitter,
    }
  }
}

#[async_trait]
impl ControlHandler for DispatchHandler {
  async fn dispatch(&self, command: Command) -> Result<CommandOutcome, String> {
    self
      .dispatcher
      .execute(command)
      .await
      .map_err(|e| e.to_string())
  }

  fn raise(&self) {
    if let Err(e) = events::emit(self.emitter.as_ref(), events::RAISE, self.dispatcher.selected()) {
      log::warn!("[instance] Failed to emit raise: {e}");
    }
  }
}

async fn handle_request(handler: &dyn ControlHandler, line: &str) -> ControlResponse {
  match serde_json::from_str::<ControlRequest>(line) {
    Ok(ControlRequest::Raise) => {
      handler.raise();
      ControlResponse::Raised
    }
    Ok(ControlRequest::Dispatch { command }) => match handler.dispatch(command).await {
      Ok(outcome) => ControlResponse::Ok { outcome },
      Err(message) => ControlResponse::Error { message },
    },
    Err(e) => ControlResponse::Error {
      message: format!("malformed request: {e}"),
    },
  }
}

#[cfg(unix)]
mod unix {
  use super::*;
  use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
  use tokio::net::{UnixListener, UnixStream};

  /// Newline-delimited JSON server on a Unix socket.
  pub struct ControlServer {
    socket_path: PathBuf,
    listener: UnixListener,
  }

  impl ControlServer {
    /// Bind the socket. Call only while holding the instance lock: any file
    /// already at the path is a leftover and gets replaced.
    pub fn bind(socket_path: &Path) -> Result<Self, AppError> {
      if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AppError::Ipc(e.to_string()))?;
      }
      let _ = std::fs::remove_file(socket_path);

      let listener = UnixListener::bind(socket_path)
        .map_err(|e| AppError::Ipc(format!("{}: {e}", socket_path.display())))?;

      use std::os::unix::fs::PermissionsExt;
      let _ = std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600));

      log::info!("[instance] Listening on {}", socket_path.display());
      Ok(Self {
        socket_path: socket_path.to_path_buf(),
        listener,
      })
    }

    pub fn socket_path(&self) -> &Path {
      &self.socket_path
    }

    pub async fn serve(self, handler: Arc<dyn ControlHandler>, shutdown: CancellationToken) {
      loop {
        tokio::select! {
          _ = shutdown.cancelled() => break,
          accepted = self.listener.accept() => match accepted {
            Ok((stream, _)) => {
              let handler = handler.clone();
              tokio::spawn(async move {
                if let Err(e) = handle_client(stream, handler).await {
                  log::debug!("[instance] Client disconnected: {e}");
                }
              });
            }
            Err(e) => log::warn!("[instance] Failed to accept control connection: {e}"),
          },
        }
      }
      log::info!("[instance] Control server stopped");
    }
  }

  impl Drop for ControlServer {
    fn drop(&mut self) {
      let _ = std::fs::remove_file(&self.socket_path);
    }
  }

  async fn handle_client(stream: UnixStream, handler: Arc<dyn ControlHandler>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
      if line.trim().is_empty() {
        continue;
      }
      let response = handle_request(handler.as_ref(), &line).await;
      let mut payload = serde_json::to_string(&response)?;
      payload.push('\n');
      writer.write_all(payload.as_bytes()).await?;
    }
    Ok(())
  }

  pub async fn send_request(
    socket_path: &Path,
    request: &ControlRequest,
  ) -> Result<ControlResponse, AppError> {
    let exchange = async {
      let stream = UnixStream::connect(socket_path).await?;
      let (reader, mut writer) = stream.into_split();

      let mut payload = serde_json::to_string(request)?;
      payload.push('\n');
      writer.write_all(payload.as_bytes()).await?;

      let mut lines = BufReader::new(reader).lines();
      let line = lines.next_line().await?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "instance closed the connection")
      })?;
      Ok::<ControlResponse, std::io::Error>(serde_json::from_str(&line)?)
    };

    match tokio::time::timeout(REQUEST_TIMEOUT, exchange).await {
      Ok(result) => result.map_err(|e| AppError::Ipc(e.to_string())),
      Err(_) => Err(AppError::Ipc("timed out waiting for the running instance".to_string())),
    }
  }

  /// Send a command to a running instance. `Ok(None)` when nothing listens.
  pub async fn try_forward(
    socket_path: &Path,
    command: Command,
  ) -> Result<Option<ControlResponse>, AppError> {
    if UnixStream::connect(socket_path).await.is_err() {
      return Ok(None);
    }
    send_request(socket_path, &ControlRequest::Dispatch { command })
      .await
      .map(Some)
  }
}

#[cfg(unix)]
pub use unix::{send_request, try_forward, ControlServer};

#[cfg(not(unix))]
pub async fn send_request(
  _socket_path: &Path,
  _request: &ControlRequest,
) -> Result<ControlResponse, AppError> {
  Err(AppError::Ipc("control socket is only available on Unix".to_string()))
}

#[cfg(not(unix))]
pub async fn try_forward(
  _socket_path: &Path,
  _command: Command,
) -> Result<Option<ControlResponse>, AppError> {
  Ok(None)
}
