//! Privileged worker process: invocation, output classification, lifecycle.
//!
//! The worker is an external `openfortivpn`-compatible executable started
//! through an elevation prefix such as `sudo -n --`. The password is written
//! to its stdin and never appears in the argument list.

use super::config::{VpnError, VpnProfile};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;

/// Consecutive read errors tolerated on one output stream.
pub const MAX_READ_RETRIES: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Fully resolved command line for one connection attempt.
#[derive(Clone)]
pub struct WorkerInvocation {
  pub program: PathBuf,
  pub args: Vec<String>,
  pub elevated: bool,
  /// Fed to stdin, one line per secret.
  stdin_payload: String,
}

impl std::fmt::Debug for WorkerInvocation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerInvocation")
      .field("program", &self.program)
      .field("args", &self.args)
      .field("elevated", &self.elevated)
      .field("stdin_payload", &"<redacted>")
      .finish()
  }
}

impl WorkerInvocation {
  pub fn command_line(&self) -> String {
    std::iter::once(self.program.display().to_string())
      .chain(self.args.iter().cloned())
      .collect::<Vec<_>>()
      .join(" ")
  }
}

fn flag(value: bool) -> &'static str {
  if value {
    "1"
  } else {
    "0"
  }
}

/// Worker arguments derived from a profile. Secrets other than the one-time
/// code stay out of this list.
pub fn build_worker_args(profile: &VpnProfile, otp: Option<&str>) -> Vec<String> {
  let mut args = vec![format!("{}:{}", profile.gateway_host, profile.gateway_port)];

  if !profile.username.is_empty() {
    args.push("-u".into());
    args.push(profile.username.clone());
  }
  if let Some(realm) = profile.realm.as_deref().filter(|r| !r.is_empty()) {
    args.push(format!("--realm={realm}"));
  }
  if let Some(code) = otp.filter(|c| !c.is_empty()) {
    args.push(format!("--otp={code}"));
  }

  if let (Some(cert), Some(key)) = (&profile.user_cert, &profile.user_key) {
    args.push(format!("--user-cert={cert}"));
    args.push(format!("--user-key={key}"));
  }
  if profile.verify_cert {
    if let Some(ca) = profile.ca_file.as_deref().filter(|c| !c.is_empty()) {
      args.push(format!("--ca-file={ca}"));
    }
    if let Some(fp) = profile.trusted_cert.as_deref().filter(|c| !c.is_empty()) {
      args.push(format!("--trusted-cert={fp}"));
    }
  }

  args.push(format!("--set-routes={}", flag(profile.set_routes)));
  args.push(format!("--set-dns={}", flag(profile.set_dns)));
  args.push(format!("--pppd-use-peerdns={}", flag(profile.pppd_use_peerdns)));

  if profile.insecure_ssl {
    args.push("--insecure-ssl".into());
  }
  if profile.debug {
    args.push("-v".into());
  }

  args
}

pub fn build_invocation(
  worker_binary: &Path,
  elevation: &[String],
  profile: &VpnProfile,
  password: &str,
  otp: Option<&str>,
) -> WorkerInvocation {
  let worker_args = build_worker_args(profile, otp);
  let stdin_payload = format!("{password}\n");

  match elevation.split_first() {
    Some((program, prefix)) => {
      let mut args: Vec<String> = prefix.to_vec();
      args.push(worker_binary.display().to_string());
      args.extend(worker_args);
      WorkerInvocation {
        program: PathBuf::from(program),
        args,
        elevated: true,
        stdin_payload,
      }
    }
    None => WorkerInvocation {
      program: worker_binary.to_path_buf(),
      args: worker_args,
      elevated: false,
      stdin_payload,
    },
  }
}

// ---- output classification ----

/// Meaning of one worker output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
  /// Tunnel negotiation advanced.
  Progress,
  /// Tunnel established.
  TunnelUp,
  AuthFailure,
  /// The elevation tool refused to run the worker.
  PrivilegeDenied,
  CertificateFailure,
  NetworkFailure,
  /// pppd reported its exit status.
  PppdExit(i32),
  /// An error line without a more specific meaning.
  Error,
  Other,
}

impl LineKind {
  /// Lines that end the attempt no matter how far it got.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      LineKind::AuthFailure | LineKind::PrivilegeDenied | LineKind::CertificateFailure
    )
  }
}

pub fn classify_line(line: &str) -> LineKind {
  let lower = line.trim().to_lowercase();

  if lower.contains("tunnel is up and running") {
    return LineKind::TunnelUp;
  }

  const PRIVILEGE: [&str; 6] = [
    "a password is required",
    "is not in the sudoers file",
    "not allowed to execute",
    "request dismissed",
    "not authorized",
    "must be run as root",
  ];
  if PRIVILEGE.iter().any(|p| lower.contains(p)) {
    return LineKind::PrivilegeDenied;
  }

  const AUTH: [&str; 4] = [
    "could not authenticate",
    "authentication failed",
    "permission denied",
    "invalid credentials",
  ];
  if AUTH.iter().any(|p| lower.contains(p)) {
    return LineKind::AuthFailure;
  }

  if lower.contains("certificate validation failed")
    || lower.contains("x509")
    || (lower.contains("certificate") && lower.starts_with("error"))
  {
    return LineKind::CertificateFailure;
  }

  if let Some(rest) = lower.split("pppd exit status code").nth(1) {
    if let Ok(code) = rest.trim().trim_end_matches('.').parse::<i32>() {
      return LineKind::PppdExit(code);
    }
  }

  const NETWORK: [&str; 8] = [
    "getaddrinfo",
    "connection refused",
    "could not connect",
    "network is unreachable",
    "no route to host",
    "timed out",
    "connection reset",
    "could not start tunnel",
  ];
  if NETWORK.iter().any(|p| lower.contains(p)) {
    return LineKind::NetworkFailure;
  }

  if lower.starts_with("error") {
    return LineKind::Error;
  }

  const PROGRESS: [&str; 7] = [
    "connected to gateway",
    "authenticated.",
    "allocated a vpn",
    "is up.",
    "setting new routes",
    "adding vpn nameservers",
    "got addresses",
  ];
  if lower.starts_with("info") || PROGRESS.iter().any(|p| lower.contains(p)) {
    return LineKind::Progress;
  }

  LineKind::Other
}

const PPPD_MESSAGES: [&str; 21] = [
  "Returned an unknown exit status",
  "Has detached, or otherwise the connection was successfully established and terminated at the peer's request.",
  "An immediately fatal error of some kind occurred, such as an essential system call failing, or running out of virtual memory.",
  "An error was detected in processing the options given, such as two mutually exclusive options being used.",
  "Is not setuid-root and the invoking user is not root.",
  "The kernel does not support PPP, for example, the PPP kernel driver is not included or cannot be loaded.",
  "Terminated because it was sent a SIGINT, SIGTERM or SIGHUP signal.",
  "The serial port could not be locked.",
  "The serial port could not be opened.",
  "The connect script failed (returned a non-zero exit status).",
  "The command specified as the argument to the pty option could not be run.",
  "The PPP negotiation failed, that is, it didn't reach the point where at least one network protocol (e.g. IP) was running.",
  "The peer system failed (or refused) to authenticate itself.",
  "The link was established successfully and terminated because it was idle.",
  "The link was established successfully and terminated because the connect time limit was reached.",
  "Callback was negotiated and an incoming call should arrive shortly.",
  "The link was terminated because the peer is not responding to echo requests.",
  "The link was terminated by the modem hanging up.",
  "The PPP negotiation failed because serial loopback was detected.",
  "The init script failed (returned a non-zero exit status).",
  "We failed to authenticate ourselves to the peer.",
];

/// Describe a pppd exit code. `None` for codes that mean a normal exit.
pub fn pppd_exit_message(code: i32) -> Option<&'static str> {
  // 16 is what pppd reports after a regular hang-up
  if code == 0 || code == 16 {
    return None;
  }
  let index = usize::try_from(code)
    .ok()
    .filter(|&i| i < PPPD_MESSAGES.len())
    .unwrap_or(0);
  Some(PPPD_MESSAGES[index])
}

// ---- exit interpretation ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
  Graceful,
  Failed(String),
}

pub fn interpret_exit(status: ExitStatus, elevated: bool) -> WorkerExit {
  if status.success() {
    return WorkerExit::Graceful;
  }

  if let Some(code) = status.code() {
    return match code {
      126 | 127 if elevated => WorkerExit::Failed(format!(
        "privilege escalation was refused or the worker could not be executed (exit code {code})"
      )),
      _ => WorkerExit::Failed(format!("worker exited with code {code}")),
    };
  }

  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
      let name = nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signal}"));
      return WorkerExit::Failed(format!("worker was terminated by {name}"));
    }
  }

  WorkerExit::Failed("worker exited with an unknown status".to_string())
}

// ---- process handle ----

/// Something the worker's output streams produced
#[derive(Debug)]
pub enum WorkerSignal {
  Line(String),
  /// A stream failed more than [`MAX_READ_RETRIES`] times in a row.
  ReadFailed(String),
  Closed,
}

/// Exclusive handle on one running worker.
#[derive(Debug)]
pub struct WorkerHandle {
  pub pid: u32,
  pub exit_status: Option<ExitStatus>,
  child: Child,
}

/// Spawn the worker in its own process group and hand it the password.
pub async fn spawn_worker(
  invocation: &WorkerInvocation,
) -> Result<(WorkerHandle, ChildStdout, ChildStderr), VpnError> {
  log::info!("[worker] Starting: {}", invocation.command_line());

  let mut cmd = Command::new(&invocation.program);
  cmd
    .args(&invocation.args)
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  #[cfg(unix)]
  cmd.process_group(0);

  let mut child = cmd.spawn().map_err(|e| {
    VpnError::WorkerSpawn(format!("{}: {e}", invocation.program.display()))
  })?;

  let pid = child.id().unwrap_or(0);
  let stdout = child
    .stdout
    .take()
    .ok_or_else(|| VpnError::WorkerSpawn("worker stdout was not captured".to_string()))?;
  let stderr = child
    .stderr
    .take()
    .ok_or_else(|| VpnError::WorkerSpawn("worker stderr was not captured".to_string()))?;

  if let Some(mut stdin) = child.stdin.take() {
    // A worker that already died closes the pipe; its exit status tells why.
    if let Err(e) = stdin.write_all(invocation.stdin_payload.as_bytes()).await {
      log::warn!("[worker] Could not hand credentials to pid {pid}: {e}");
    }
    drop(stdin);
  }

  log::info!("[worker] Started with PID {pid}");

  Ok((
    WorkerHandle {
      pid,
      exit_status: None,
      child,
    },
    stdout,
    stderr,
  ))
}

impl WorkerHandle {
  pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
    let status = self.child.wait().await?;
    self.exit_status = Some(status);
    Ok(status)
  }

  pub fn try_wait(&mut self) -> Option<ExitStatus> {
    if self.exit_status.is_none() {
      if let Ok(Some(status)) = self.child.try_wait() {
        self.exit_status = Some(status);
      }
    }
    self.exit_status
  }

  /// SIGTERM the process group, wait up to `grace`, then SIGKILL. Always
  /// reaps the child. Tolerates a worker that is already gone.
  pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
    if let Some(status) = self.try_wait() {
      return Some(status);
    }

    log::info!("[worker] Terminating PID {}", self.pid);
    #[cfg(unix)]
    signal_group(self.pid, nix::sys::signal::Signal::SIGTERM);
    #[cfg(not(unix))]
    let _ = self.child.start_kill();

    if let Ok(Ok(status)) = tokio::time::timeout(grace, self.wait()).await {
      return Some(status);
    }

    log::warn!(
      "[worker] PID {} ignored SIGTERM for {grace:?}, killing",
      self.pid
    );
    #[cfg(unix)]
    signal_group(self.pid, nix::sys::signal::Signal::SIGKILL);
    let _ = self.child.start_kill();
    self.wait().await.ok()
  }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
  use nix::errno::Errno;
  use nix::sys::signal::{kill, killpg};
  use nix::unistd::Pid;

  let Ok(raw) = i32::try_from(pid) else {
    return;
  };
  if raw <= 0 {
    return;
  }
  match killpg(Pid::from_raw(raw), signal) {
    Ok(()) | Err(Errno::ESRCH) => {}
    Err(e) => {
      log::debug!("[worker] killpg({raw}, {signal:?}) failed: {e}, signalling the leader only");
      let _ = kill(Pid::from_raw(raw), signal);
    }
  }
}

/// Forward lines from one worker stream. Transient read errors are retried a
/// bounded number of times.
pub fn spawn_output_reader<R>(stream: R, tx: mpsc::Sender<WorkerSignal>)
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let mut lines = BufReader::new(stream).lines();
    let mut failures = 0u32;
    loop {
      match lines.next_line().await {
        Ok(Some(line)) => {
          failures = 0;
          if tx.send(WorkerSignal::Line(line)).await.is_err() {
            return;
          }
        }
        Ok(None) => {
          let _ = tx.send(WorkerSignal::Closed).await;
          return;
        }
        Err(e) => {
          failures += 1;
          if failures > MAX_READ_RETRIES {
            let _ = tx.send(WorkerSignal::ReadFailed(e.to_string())).await;
            return;
          }
          log::debug!("[worker] Read error ({failures}/{MAX_READ_RETRIES}): {e}");
          tokio::time::sleep(READ_RETRY_DELAY).await;
        }
      }
    }
  });
}

// ---- process table helpers ----

pub fn is_process_running(pid: u32) -> bool {
  use sysinfo::{Pid, ProcessesToUpdate, System};
  let pid = Pid::from_u32(pid);
  let mut system = System::new();
  system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
  system.process(pid).is_some()
}

/// PIDs of processes whose executable name matches the worker binary.
pub fn find_worker_processes(worker_binary: &Path) -> Vec<u32> {
  use sysinfo::{ProcessesToUpdate, System};

  let Some(name) = worker_binary.file_name() else {
    return Vec::new();
  };
  let mut system = System::new();
  system.refresh_processes(ProcessesToUpdate::All, true);
  system
    .processes()
    .iter()
    .filter(|(_, process)| process.name() == name)
    .map(|(pid, _)| pid.as_u32())
    .collect()
}

/// Terminate stray workers left over from another session. Root-owned ones are
/// signalled through the elevation prefix. Returns how many were signalled.
pub async fn kill_stray_workers(worker_binary: &Path, elevation: &[String]) -> usize {
  let pids: Vec<u32> = find_worker_processes(worker_binary)
    .into_iter()
    .filter(|&pid| pid != std::process::id())
    .collect();
  let mut signalled = 0;

  for pid in pids {
    #[cfg(unix)]
    {
      use nix::errno::Errno;
      use nix::sys::signal::{kill, Signal};
      use nix::unistd::Pid;

      let Ok(raw) = i32::try_from(pid) else {
        continue;
      };
      match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => signalled += 1,
        Err(Errno::ESRCH) => {}
        Err(Errno::EPERM) if !elevation.is_empty() => {
          let (program, prefix) = (&elevation[0], &elevation[1..]);
          let status = Command::new(program)
            .args(prefix)
            .args(["kill", "-TERM", &pid.to_string()])
            .stdin(Stdio::null())
            .status()
            .await;
          match status {
            Ok(s) if s.success() => signalled += 1,
            Ok(s) => log::warn!("[worker] Elevated kill of PID {pid} failed: {s}"),
            Err(e) => log::warn!("[worker] Elevated kill of PID {pid} failed: {e}"),
          }
        }
        Err(e) => log::warn!("[worker] Could not signal stray worker {pid}: {e}"),
      }
    }
    #[cfg(not(unix))]
    {
      let _ = elevation;
      log::warn!("[worker] Stray worker {pid} found, cannot signal on this platform");
    }
  }

  signalled
}
