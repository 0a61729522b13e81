pub mod app_dirs;
pub mod credential_cipher;
pub mod dispatcher;
pub mod events;
pub mod settings_manager;
pub mod single_instance;
pub mod vpn;

pub use dispatcher::{resolve_store_path, Command, CommandOutcome, Dispatcher, ProfileChanges};
pub use single_instance::AppError;

use crate::events::{EventEmitter, LogEmitter};
use crate::settings_manager::AppSettings;
use crate::single_instance::{DispatchHandler, InstanceGuard};
use crate::vpn::{StatusReporter, Supervisor, SupervisorConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// `RUST_LOG` wins over `default_level`. With a log file the output is
/// appended there, falling back to stderr when the file cannot be opened.
pub fn init_logging(default_level: log::LevelFilter, log_file: Option<&Path>) {
  let target = log_file
    .and_then(|path| {
      if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
      }
      std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
    })
    .map(|file| env_logger::Target::Pipe(Box::new(file)))
    .unwrap_or(env_logger::Target::Stderr);

  let _ = env_logger::Builder::new()
    .filter_level(default_level)
    .parse_default_env()
    .format_timestamp_millis()
    .target(target)
    .try_init();
}

/// How long a supervising process stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
  /// Until interrupted.
  Resident,
  /// Until no profile is active any more.
  UntilIdle,
}

/// Become the supervising instance: claim the instance lock, serve the control
/// socket, optionally run `initial`, and stop the active connection on exit.
pub async fn run_instance(
  settings: &AppSettings,
  store_path: &Path,
  initial: Option<Command>,
  residency: Residency,
) -> Result<(), Box<dyn std::error::Error>> {
  let socket_path = app_dirs::control_socket();
  let _guard = InstanceGuard::acquire(&app_dirs::instance_lock_name(), &socket_path).await?;
  log::info!("[instance] Starting with PID {}", std::process::id());

  let supervisor = Arc::new(Supervisor::new(SupervisorConfig::from(settings)));
  let (dispatcher, load_error) = Dispatcher::open(
    store_path,
    settings.global_profiles_path.clone(),
    supervisor.clone(),
  );
  if let Some(e) = load_error {
    eprintln!("Warning: {e}");
  }
  let dispatcher = Arc::new(dispatcher);

  let emitter: Arc<dyn EventEmitter> = Arc::new(LogEmitter);
  let reporter = StatusReporter::new(emitter.clone()).spawn(supervisor.subscribe());
  let mut transitions = supervisor.subscribe();

  let shutdown = CancellationToken::new();
  let server_task = start_control_server(&socket_path, &dispatcher, &emitter, &shutdown)?;

  let result = async {
    if let Some(command) = initial {
      println!("{}", dispatcher.execute(command).await?);
    }
    if residency == Residency::UntilIdle && supervisor.active_profile().await.is_none() {
      return Ok(());
    }

    loop {
      tokio::select! {
        _ = termination_signal() => {
          log::info!("[instance] Termination requested");
          break;
        }
        event = transitions.recv() => match event {
          Ok(event) if residency == Residency::UntilIdle && !event.state.is_active() => {
            if supervisor.active_profile().await.is_none() {
              break;
            }
          }
          Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
          Err(broadcast::error::RecvError::Closed) => break,
        },
      }
    }
    Ok::<(), vpn::VpnError>(())
  }
  .await;

  dispatcher.shutdown().await;
  shutdown.cancel();
  if let Some(task) = server_task {
    let _ = task.await;
  }
  reporter.abort();
  log::info!("[instance] Stopped");

  result.map_err(Into::into)
}

#[cfg(unix)]
fn start_control_server(
  socket_path: &Path,
  dispatcher: &Arc<Dispatcher>,
  emitter: &Arc<dyn EventEmitter>,
  shutdown: &CancellationToken,
) -> Result<Option<tokio::task::JoinHandle<()>>, AppError> {
  let server = single_instance::ControlServer::bind(socket_path)?;
  let handler = Arc::new(DispatchHandler::new(dispatcher.clone(), emitter.clone()));
  Ok(Some(tokio::spawn(server.serve(handler, shutdown.clone()))))
}

#[cfg(not(unix))]
fn start_control_server(
  _socket_path: &Path,
  _dispatcher: &Arc<Dispatcher>,
  _emitter: &Arc<dyn EventEmitter>,
  _shutdown: &CancellationToken,
) -> Result<Option<tokio::task::JoinHandle<()>>, AppError> {
  log::warn!("[instance] Control socket unavailable on this platform");
  Ok(None)
}

async fn termination_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
      Ok(mut sigterm) => {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => {}
          _ = sigterm.recv() => {}
        }
      }
      Err(e) => {
        log::warn!("[instance] Cannot watch SIGTERM: {e}");
        let _ = tokio::signal::ctrl_c().await;
      }
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}
