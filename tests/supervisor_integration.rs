//! Supervisor integration tests
//!
//! A shell script stands in for `openfortivpn`, so no root is needed. Tests are
//! serialized because `kill_all` sweeps the whole process table.

#![cfg(unix)]

mod common;

use common::{FakeWorker, TestUtils};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vpnkeeper_lib::credential_cipher::CredentialCipher;
use vpnkeeper_lib::vpn::status::notification;
use vpnkeeper_lib::vpn::{ConnectionState, ProfileStore, VpnError, VpnProfile};
use vpnkeeper_lib::{Command, Dispatcher, ProfileChanges};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
#[serial]
async fn test_office_connect_and_disconnect() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Connects);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));
  let mut events = supervisor.subscribe();

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);

  let pid = supervisor.status_of("Office").await.pid.unwrap();
  supervisor.disconnect("Office").await.unwrap();
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
  assert!(TestUtils::wait_for_exit(pid, WAIT).await, "worker {pid} survived disconnect");

  let mut seen = Vec::new();
  while let Ok(event) = events.try_recv() {
    seen.push(event);
  }
  let states: Vec<ConnectionState> = seen.iter().map(|e| e.state).collect();
  assert_eq!(
    states,
    vec![
      ConnectionState::Connecting,
      ConnectionState::Connected,
      ConnectionState::Disconnected
    ]
  );
  assert_eq!(notification(&seen[1]).as_deref(), Some("VPN Office is connected"));
  assert_eq!(notification(&seen[2]).as_deref(), Some("VPN Office is disconnected"));

  let args = TestUtils::recorded_args(&worker);
  assert!(args.starts_with("vpn.example.com:443 -u alice"));
}

#[tokio::test]
#[serial]
async fn test_disconnect_while_connecting_leaves_no_worker() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Stalls);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  let pid = supervisor.status_of("Office").await.pid.unwrap();
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Connecting);

  supervisor.disconnect("Office").await.unwrap();
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
  assert!(TestUtils::wait_for_exit(pid, WAIT).await);
  assert!(supervisor.active_profile().await.is_none());
}

#[tokio::test]
#[serial]
async fn test_second_connect_is_refused() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Stalls);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  let home = VpnProfile::new("Home", "home.example.com", 443);

  match supervisor.connect(&home, None).await {
    Err(VpnError::AlreadyActive { active }) => assert_eq!(active, "Office"),
    other => panic!("expected AlreadyActive, got {other:?}"),
  }
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Connecting);
  assert_eq!(supervisor.state_of("Home").await, ConnectionState::Disconnected);
  assert!(matches!(
    supervisor.ensure_idle("Office").await,
    Err(VpnError::ProfileBusy(_))
  ));

  supervisor.disconnect("Office").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_kill_all_is_idempotent() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Connects);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  assert_eq!(supervisor.kill_all().await, 0);
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);
  let pid = supervisor.status_of("Office").await.pid.unwrap();

  assert!(supervisor.kill_all().await >= 1);
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
  assert!(TestUtils::wait_for_exit(pid, WAIT).await);

  supervisor.kill_all().await;
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
}

#[tokio::test]
#[serial]
async fn test_password_goes_to_stdin_not_argv() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Connects);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  let mut profile = TestUtils::office();
  profile.set_password("hunter2", CredentialCipher::app());

  supervisor.connect(&profile, None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);

  assert_eq!(TestUtils::recorded_stdin(&worker), "hunter2");
  assert!(!TestUtils::recorded_args(&worker).contains("hunter2"));

  supervisor.disconnect("Office").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_otp_is_passed_as_argument() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Connects);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  let mut profile = TestUtils::office();
  profile.otp = true;
  supervisor.connect(&profile, Some("654321")).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);

  assert!(TestUtils::recorded_args(&worker).contains("--otp=654321"));
  supervisor.disconnect("Office").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_rejected_password_sets_error() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::RejectsPassword);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Error, WAIT).await);

  let status = supervisor.status_of("Office").await;
  assert!(status.last_error.unwrap().contains("Could not authenticate"));
  assert!(status.pid.is_none());

  // Error neither blocks edits nor a new attempt; disconnect clears it
  assert!(supervisor.ensure_idle("Office").await.is_ok());
  supervisor.disconnect("Office").await.unwrap();
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
}

#[tokio::test]
#[serial]
async fn test_connect_timeout_sets_error() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Stalls);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(1));

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  let pid = supervisor.status_of("Office").await.pid.unwrap();

  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Error, WAIT).await);
  let status = supervisor.status_of("Office").await;
  assert!(status.last_error.unwrap().contains("no tunnel within"));
  assert!(TestUtils::wait_for_exit(pid, WAIT).await);
}

#[tokio::test]
#[serial]
async fn test_logout_after_connect_is_graceful() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::LogsOut);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);
  assert!(
    TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Disconnected, WAIT).await
  );
  assert!(supervisor.active_profile().await.is_none());
  assert!(supervisor.status_of("Office").await.last_error.is_none());
}

#[tokio::test]
#[serial]
async fn test_stubborn_worker_is_killed() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::IgnoresSigterm);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);
  let pid = supervisor.status_of("Office").await.pid.unwrap();

  supervisor.disconnect("Office").await.unwrap();
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
  assert!(TestUtils::wait_for_exit(pid, WAIT).await);
}

#[tokio::test]
#[serial]
async fn test_concurrent_stop_keeps_one_worker() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::IgnoresSigterm);
  let supervisor = Arc::new(TestUtils::supervisor(&worker, Duration::from_secs(10)));

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);
  let office_pid = supervisor.status_of("Office").await.pid.unwrap();

  let first = tokio::spawn({
    let supervisor = supervisor.clone();
    async move { supervisor.disconnect("Office").await }
  });
  tokio::time::sleep(Duration::from_millis(100)).await;

  // Waits for the stop in flight instead of declaring the profile idle
  supervisor.disconnect("Office").await.unwrap();
  assert!(!vpnkeeper_lib::vpn::worker::is_process_running(office_pid));
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
  first.await.unwrap().unwrap();

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);
  let second_pid = supervisor.status_of("Office").await.pid.unwrap();

  let stopping = tokio::spawn({
    let supervisor = supervisor.clone();
    async move { supervisor.kill_all().await }
  });
  tokio::time::sleep(Duration::from_millis(100)).await;

  let mut home = VpnProfile::new("Home", "home.example.com", 443);
  home.username = "alice".to_string();
  supervisor.connect(&home, None).await.unwrap();
  assert!(!vpnkeeper_lib::vpn::worker::is_process_running(second_pid));
  assert!(stopping.await.unwrap() >= 1);

  assert!(TestUtils::wait_for_state(&supervisor, "Home", ConnectionState::Connected, WAIT).await);
  assert_eq!(supervisor.active_profile().await.as_deref(), Some("Home"));
  supervisor.kill_all().await;
}

#[tokio::test]
#[serial]
async fn test_reconnect_after_failure() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::RejectsPassword);
  let supervisor = TestUtils::supervisor(&worker, Duration::from_secs(10));

  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Error, WAIT).await);

  TestUtils::write_fake_worker(dir.path(), FakeWorker::Connects);
  supervisor.connect(&TestUtils::office(), None).await.unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);
  assert!(supervisor.status_of("Office").await.last_error.is_none());

  supervisor.disconnect("Office").await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_dispatcher_refuses_edits_while_connected() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Connects);
  let supervisor = Arc::new(TestUtils::supervisor(&worker, Duration::from_secs(10)));

  let store_path = dir.path().join("profiles.json");
  let mut store = ProfileStore::load(&store_path).unwrap();
  store.add_profile(TestUtils::office()).unwrap();
  let dispatcher = Dispatcher::new(store, supervisor.clone(), None);

  dispatcher
    .execute(Command::Connect {
      name: "Office".to_string(),
      otp: None,
    })
    .await
    .unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);

  let edit = dispatcher
    .execute(Command::EditProfile {
      name: "Office".to_string(),
      changes: ProfileChanges {
        gateway_port: Some(10443),
        ..ProfileChanges::default()
      },
    })
    .await;
  assert!(matches!(edit, Err(VpnError::ProfileBusy(_))));

  let delete = dispatcher
    .execute(Command::DeleteProfile {
      name: "Office".to_string(),
    })
    .await;
  assert!(matches!(delete, Err(VpnError::ProfileBusy(_))));

  let switch = dispatcher
    .execute(Command::UseConfig {
      path: dir.path().join("other.json"),
    })
    .await;
  assert!(matches!(switch, Err(VpnError::ProfileBusy(_))));

  let status = dispatcher.execute(Command::Status).await.unwrap().to_string();
  assert_eq!(status, "Office: Connected");

  dispatcher.shutdown().await;
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
  assert_eq!(dispatcher.profile("Office").unwrap().gateway_port, 443);
}

#[tokio::test]
#[serial]
async fn test_same_config_is_accepted_while_connected() {
  let dir = TempDir::new().unwrap();
  let worker = TestUtils::write_fake_worker(dir.path(), FakeWorker::Connects);
  let supervisor = Arc::new(TestUtils::supervisor(&worker, Duration::from_secs(10)));

  let store_path = dir.path().join("profiles.json");
  let mut store = ProfileStore::load(&store_path).unwrap();
  store.add_profile(TestUtils::office()).unwrap();
  let dispatcher = Dispatcher::new(store, supervisor.clone(), None);

  dispatcher
    .execute(Command::Connect {
      name: "Office".to_string(),
      otp: None,
    })
    .await
    .unwrap();
  assert!(TestUtils::wait_for_state(&supervisor, "Office", ConnectionState::Connected, WAIT).await);

  for path in [store_path.clone(), dir.path().join(".").join("profiles.json")] {
    dispatcher
      .execute(Command::UseConfig { path })
      .await
      .unwrap();
  }
  assert_eq!(dispatcher.store_path().unwrap(), store_path);

  dispatcher
    .execute(Command::Disconnect {
      name: "Office".to_string(),
    })
    .await
    .unwrap();
  assert_eq!(supervisor.state_of("Office").await, ConnectionState::Disconnected);
}
