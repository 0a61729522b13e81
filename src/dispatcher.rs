//! Routes operator commands to the profile store and the supervisor.

use crate::credential_cipher::CredentialCipher;
use crate::vpn::{status, ConnectionState, ProfileStore, Supervisor, VpnError, VpnGroup, VpnProfile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Field-wise edit of a stored profile. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileChanges {
  pub rename: Option<String>,
  pub gateway_host: Option<String>,
  pub gateway_port: Option<u16>,
  pub username: Option<String>,
  pub otp: Option<bool>,
  pub realm: Option<String>,
  pub user_cert: Option<String>,
  pub user_key: Option<String>,
  pub ca_file: Option<String>,
  pub trusted_cert: Option<String>,
  pub verify_cert: Option<bool>,
  pub set_routes: Option<bool>,
  pub set_dns: Option<bool>,
  pub pppd_use_peerdns: Option<bool>,
  pub insecure_ssl: Option<bool>,
  pub debug: Option<bool>,
}

/// Empty strings clear optional text fields.
fn apply_text(target: &mut Option<String>, value: &Option<String>) {
  if let Some(value) = value {
    *target = if value.is_empty() { None } else { Some(value.clone()) };
  }
}

impl ProfileChanges {
  pub fn apply(&self, profile: &mut VpnProfile) {
    if let Some(name) = &self.rename {
      profile.name = name.clone();
    }
    if let Some(host) = &self.gateway_host {
      profile.gateway_host = host.clone();
    }
    if let Some(port) = self.gateway_port {
      profile.gateway_port = port;
    }
    if let Some(username) = &self.username {
      profile.username = username.clone();
    }
    apply_text(&mut profile.realm, &self.realm);
    apply_text(&mut profile.user_cert, &self.user_cert);
    apply_text(&mut profile.user_key, &self.user_key);
    apply_text(&mut profile.ca_file, &self.ca_file);
    apply_text(&mut profile.trusted_cert, &self.trusted_cert);

    let flags = [
      (&mut profile.otp, self.otp),
      (&mut profile.verify_cert, self.verify_cert),
      (&mut profile.set_routes, self.set_routes),
      (&mut profile.set_dns, self.set_dns),
      (&mut profile.pppd_use_peerdns, self.pppd_use_peerdns),
      (&mut profile.insecure_ssl, self.insecure_ssl),
      (&mut profile.debug, self.debug),
    ];
    for (field, value) in flags {
      if let Some(value) = value {
        *field = value;
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
  Connect {
    name: String,
    otp: Option<String>,
  },
  Disconnect {
    name: String,
  },
  KillAll,
  /// Make a profile the current selection of the front end.
  Select {
    name: String,
  },
  Status,
  List,
  AddProfile {
    profile: VpnProfile,
    password: Option<String>,
  },
  EditProfile {
    name: String,
    changes: ProfileChanges,
  },
  DeleteProfile {
    name: String,
  },
  CopyProfile {
    name: String,
    new_name: String,
  },
  SetPassword {
    name: String,
    password: String,
  },
  AddGroup {
    group: VpnGroup,
  },
  EditGroup {
    name: String,
    rename: Option<String>,
    members: Option<Vec<String>>,
  },
  DeleteGroup {
    name: String,
  },
  CopyGroup {
    name: String,
    new_name: String,
  },
  UseConfig {
    path: PathBuf,
  },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
  Done { message: String },
  Rows { rows: Vec<String> },
  Selected { name: String, state: ConnectionState },
}

impl std::fmt::Display for CommandOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CommandOutcome::Done { message } => write!(f, "{message}"),
      CommandOutcome::Rows { rows } => write!(f, "{}", rows.join("\n")),
      CommandOutcome::Selected { name, state } => write!(f, "{name}: {state}"),
    }
  }
}

fn done(message: String) -> Result<CommandOutcome, VpnError> {
  Ok(CommandOutcome::Done { message })
}

/// Explicit `--config` path wins over the default store in the data dir.
pub fn resolve_store_path(config_override: Option<&Path>) -> PathBuf {
  match config_override {
    Some(path) => path.to_path_buf(),
    None => crate::app_dirs::store_file(),
  }
}

pub struct Dispatcher {
  store: RwLock<ProfileStore>,
  supervisor: Arc<Supervisor>,
  cipher: CredentialCipher,
  global_path: Option<PathBuf>,
  selected: Mutex<Option<String>>,
  /// Serializes connects against edits, so a profile cannot change between
  /// its idle check and the store write.
  profile_gate: tokio::sync::Mutex<()>,
}

impl Dispatcher {
  pub fn new(store: ProfileStore, supervisor: Arc<Supervisor>, global_path: Option<PathBuf>) -> Self {
    Self {
      store: RwLock::new(store),
      supervisor,
      cipher: CredentialCipher::app().clone(),
      global_path,
      selected: Mutex::new(None),
      profile_gate: tokio::sync::Mutex::new(()),
    }
  }

  /// Open the store at `path`. A load failure is returned next to a dispatcher
  /// working on an empty store.
  pub fn open(
    path: &Path,
    global_path: Option<PathBuf>,
    supervisor: Arc<Supervisor>,
  ) -> (Self, Option<VpnError>) {
    let (store, error) = ProfileStore::open(path, global_path.as_deref());
    (Self::new(store, supervisor, global_path), error)
  }

  pub fn supervisor(&self) -> &Arc<Supervisor> {
    &self.supervisor
  }

  pub fn store_path(&self) -> Result<PathBuf, VpnError> {
    Ok(self.read_store()?.path().to_path_buf())
  }

  pub fn profile(&self, name: &str) -> Result<VpnProfile, VpnError> {
    self
      .read_store()?
      .profile(name)
      .cloned()
      .ok_or_else(|| VpnError::NotFound(name.to_string()))
  }

  pub fn selected(&self) -> Option<String> {
    self.selected.lock().ok().and_then(|s| s.clone())
  }

  fn read_store(&self) -> Result<RwLockReadGuard<'_, ProfileStore>, VpnError> {
    self
      .store
      .read()
      .map_err(|_| VpnError::Store("profile store lock poisoned".to_string()))
  }

  fn write_store(&self) -> Result<RwLockWriteGuard<'_, ProfileStore>, VpnError> {
    self
      .store
      .write()
      .map_err(|_| VpnError::Store("profile store lock poisoned".to_string()))
  }

  /// Switch to another store file. Refused while any profile is active;
  /// naming the store already in use is a no-op.
  pub async fn use_config(&self, path: &Path) -> Result<Option<VpnError>, VpnError> {
    let _gate = self.profile_gate.lock().await;
    if same_file(&self.store_path()?, path) {
      return Ok(None);
    }
    if let Some(active) = self.supervisor.active_profile().await {
      return Err(VpnError::ProfileBusy(active));
    }
    let (store, error) = ProfileStore::open(path, self.global_path.as_deref());
    *self.write_store()? = store;
    if let Ok(mut selected) = self.selected.lock() {
      *selected = None;
    }
    log::info!("[dispatcher] Using profile store {}", path.display());
    Ok(error)
  }

  /// Stop the active connection before the process goes away.
  pub async fn shutdown(&self) {
    if let Some(active) = self.supervisor.active_profile().await {
      log::info!("[dispatcher] Shutting down, disconnecting '{active}'");
      if let Err(e) = self.supervisor.disconnect(&active).await {
        log::warn!("[dispatcher] Disconnect during shutdown failed: {e}");
      }
    }
  }

  fn overview(&self, statuses: &[crate::vpn::ProfileStatus]) -> Result<Vec<String>, VpnError> {
    let store = self.read_store()?;
    Ok(status::format_overview(store.profiles(), store.groups(), statuses))
  }

  pub async fn execute(&self, command: Command) -> Result<CommandOutcome, VpnError> {
    log::debug!("[dispatcher] {}", command_label(&command));

    match command {
      Command::Connect { name, otp } => {
        let _gate = self.profile_gate.lock().await;
        let profile = self.profile(&name)?;
        self.supervisor.connect(&profile, otp.as_deref()).await?;
        done(format!("Connecting VPN {name}"))
      }
      Command::Disconnect { name } => {
        self.supervisor.disconnect(&name).await?;
        done(format!("VPN {name} is disconnected"))
      }
      Command::KillAll => {
        let killed = self.supervisor.kill_all().await;
        done(format!("Terminated {killed} VPN process(es)"))
      }
      Command::Select { name } => {
        self.profile(&name)?;
        if let Ok(mut selected) = self.selected.lock() {
          *selected = Some(name.clone());
        }
        let state = self.supervisor.state_of(&name).await;
        Ok(CommandOutcome::Selected { name, state })
      }
      Command::Status => {
        let statuses = self.supervisor.snapshot().await;
        let rows: Vec<String> = statuses
          .iter()
          .filter(|s| s.state != ConnectionState::Disconnected)
          .map(|s| format!("{}: {}", s.name, status::status_line(s)))
          .collect();
        if rows.is_empty() {
          return done("No VPN is connected".to_string());
        }
        Ok(CommandOutcome::Rows { rows })
      }
      Command::List => {
        let statuses = self.supervisor.snapshot().await;
        Ok(CommandOutcome::Rows {
          rows: self.overview(&statuses)?,
        })
      }
      Command::AddProfile { profile, password } => {
        let name = profile.name.clone();
        let mut profile = profile;
        if let Some(password) = password {
          profile.set_password(&password, &self.cipher);
        }
        self.write_store()?.add_profile(profile)?;
        done(format!("Added VPN {name}"))
      }
      Command::EditProfile { name, changes } => {
        let _gate = self.profile_gate.lock().await;
        self.supervisor.ensure_idle(&name).await?;
        let mut profile = self.profile(&name)?;
        changes.apply(&mut profile);
        let new_name = profile.name.clone();
        self.write_store()?.update_profile(&name, profile)?;
        if new_name != name {
          self.supervisor.forget(&name).await;
        }
        done(format!("Updated VPN {new_name}"))
      }
      Command::DeleteProfile { name } => {
        let _gate = self.profile_gate.lock().await;
        self.supervisor.ensure_idle(&name).await?;
        self.write_store()?.delete_profile(&name)?;
        self.supervisor.forget(&name).await;
        done(format!("Deleted VPN {name}"))
      }
      Command::CopyProfile { name, new_name } => {
        let copy = self.write_store()?.copy_profile(&name, &new_name)?;
        done(format!("Copied VPN {name} to {}", copy.name))
      }
      Command::SetPassword { name, password } => {
        let _gate = self.profile_gate.lock().await;
        self.supervisor.ensure_idle(&name).await?;
        self
          .write_store()?
          .set_password(&name, &password, &self.cipher)?;
        done(format!("Password of VPN {name} updated"))
      }
      Command::AddGroup { group } => {
        let name = group.name.clone();
        self.write_store()?.add_group(group)?;
        done(format!("Added group {name}"))
      }
      Command::EditGroup {
        name,
        rename,
        members,
      } => {
        let current = self
          .read_store()?
          .group(&name)
          .cloned()
          .ok_or_else(|| VpnError::NotFound(name.clone()))?;
        let group = VpnGroup::new(
          rename.as_deref().unwrap_or(&current.name),
          members.unwrap_or(current.members),
        );
        let new_name = group.name.clone();
        self.write_store()?.update_group(&name, group)?;
        done(format!("Updated group {new_name}"))
      }
      Command::DeleteGroup { name } => {
        self.write_store()?.delete_group(&name)?;
        done(format!("Deleted group {name}"))
      }
      Command::CopyGroup { name, new_name } => {
        let copy = self.write_store()?.copy_group(&name, &new_name)?;
        done(format!("Copied group {name} to {}", copy.name))
      }
      Command::UseConfig { path } => match self.use_config(&path).await? {
        Some(load_error) => done(format!(
          "Using {} (started empty: {load_error})",
          path.display()
        )),
        None => done(format!("Using {}", path.display())),
      },
    }
  }
}

fn same_file(current: &Path, requested: &Path) -> bool {
  match (current.canonicalize(), requested.canonicalize()) {
    (Ok(current), Ok(requested)) => current == requested,
    _ => current == requested,
  }
}

/// Command name for logs; never includes secrets.
fn command_label(command: &Command) -> String {
  match command {
    Command::Connect { name, .. } => format!("connect {name}"),
    Command::Disconnect { name } => format!("disconnect {name}"),
    Command::KillAll => "kill-all".to_string(),
    Command::Select { name } => format!("select {name}"),
    Command::Status => "status".to_string(),
    Command::List => "list".to_string(),
    Command::AddProfile { profile, .. } => format!("profile add {}", profile.name),
    Command::EditProfile { name, .. } => format!("profile edit {name}"),
    Command::DeleteProfile { name } => format!("profile delete {name}"),
    Command::CopyProfile { name, .. } => format!("profile copy {name}"),
    Command::SetPassword { name, .. } => format!("profile set-password {name}"),
    Command::AddGroup { group } => format!("group add {}", group.name),
    Command::EditGroup { name, .. } => format!("group edit {name}"),
    Command::DeleteGroup { name } => format!("group delete {name}"),
    Command::CopyGroup { name, .. } => format!("group copy {name}"),
    Command::UseConfig { path } => format!("use-config {}", path.display()),
  }
}
