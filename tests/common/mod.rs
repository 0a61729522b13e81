#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use vpnkeeper_lib::vpn::{ConnectionState, Supervisor, SupervisorConfig, VpnProfile};

/// Utility functions for integration tests
pub struct TestUtils;

/// Shell body run after the worker has read its password line.
pub enum FakeWorker {
  /// Brings the tunnel up and stays.
  Connects,
  /// Talks to the gateway but never brings the tunnel up.
  Stalls,
  /// Rejects the credentials and exits.
  RejectsPassword,
  /// Brings the tunnel up, then logs out on its own.
  LogsOut,
  /// Brings the tunnel up and ignores SIGTERM.
  IgnoresSigterm,
}

impl FakeWorker {
  fn body(&self) -> &'static str {
    match self {
      FakeWorker::Connects => {
        r#"echo "INFO:   Connected to gateway."
echo "INFO:   Authenticated."
echo "INFO:   Remote gateway has allocated a VPN."
echo "INFO:   Interface ppp0 is UP."
echo "INFO:   Tunnel is up and running."
exec sleep 30"#
      }
      FakeWorker::Stalls => {
        r#"echo "INFO:   Connected to gateway."
exec sleep 30"#
      }
      FakeWorker::RejectsPassword => {
        r#"echo "INFO:   Connected to gateway."
echo "ERROR:  Could not authenticate to gateway. Please check the password, client certificate, etc." >&2
echo "INFO:   Closed connection to gateway."
exit 1"#
      }
      FakeWorker::LogsOut => {
        r#"echo "INFO:   Tunnel is up and running."
sleep 1
echo "INFO:   Logged out."
exit 0"#
      }
      FakeWorker::IgnoresSigterm => {
        r#"trap '' TERM
echo "INFO:   Tunnel is up and running."
while true; do sleep 1; done"#
      }
    }
  }
}

impl TestUtils {
  /// Write an executable stand-in for `openfortivpn` into `dir`. It records
  /// its arguments and the password line it read next to itself.
  pub fn write_fake_worker(dir: &Path, behaviour: FakeWorker) -> PathBuf {
    let path = dir.join("fake-openfortivpn");
    let script = format!(
      "#!/bin/sh\nread -r password\nprintf '%s' \"$password\" > \"$0.stdin\"\necho \"$@\" > \"$0.args\"\n{}\n",
      behaviour.body()
    );
    fs::write(&path, script).unwrap();

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
  }

  pub fn recorded_stdin(worker: &Path) -> String {
    fs::read_to_string(format!("{}.stdin", worker.display())).unwrap_or_default()
  }

  pub fn recorded_args(worker: &Path) -> String {
    fs::read_to_string(format!("{}.args", worker.display())).unwrap_or_default()
  }

  /// Supervisor that runs `worker` directly, without privilege escalation.
  pub fn supervisor(worker: &Path, connect_timeout: Duration) -> Supervisor {
    Supervisor::new(SupervisorConfig {
      worker_binary: worker.to_path_buf(),
      elevation: Vec::new(),
      connect_timeout,
      terminate_grace: Duration::from_millis(500),
    })
  }

  pub fn office() -> VpnProfile {
    let mut profile = VpnProfile::new("Office", "vpn.example.com", 443);
    profile.username = "alice".to_string();
    profile
  }

  /// Poll until `name` reaches `state`.
  pub async fn wait_for_state(
    supervisor: &Supervisor,
    name: &str,
    state: ConnectionState,
    timeout: Duration,
  ) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
      if supervisor.state_of(name).await == state {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
  }

  /// Poll until the process is gone from the process table.
  pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
      if !vpnkeeper_lib::vpn::worker::is_process_running(pid) {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
  }
}
