//! VPN profile, group and connection state types.

use crate::credential_cipher::{CipherError, CredentialCipher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// VPN-related errors
#[derive(Error, Debug)]
pub enum VpnError {
  #[error("Storage error: {0}")]
  Store(String),
  #[error("Credential error: {0}")]
  Cipher(#[from] CipherError),
  #[error("Global VPN profile '{0}' cannot be modified or deleted")]
  ImmutableProfile(String),
  #[error("VPN '{0}' must be disconnected to perform this action")]
  ProfileBusy(String),
  #[error("VPN '{active}' is already active, disconnect it first")]
  AlreadyActive { active: String },
  #[error("Failed to start VPN worker: {0}")]
  WorkerSpawn(String),
  #[error("VPN not found: {0}")]
  NotFound(String),
  #[error("VPN '{0}' is not connected")]
  NotActive(String),
  #[error("Name already in use: {0}")]
  Duplicate(String),
  #[error("Invalid VPN profile: {0}")]
  InvalidProfile(String),
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

/// Where a profile was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileOrigin {
  #[default]
  Local,
  /// Machine-wide profile, read-only for the operator.
  Global,
}

fn default_port() -> u16 {
  443
}

fn default_true() -> bool {
  true
}

/// A stored VPN connection definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpnProfile {
  pub name: String,
  pub gateway_host: String,
  #[serde(default = "default_port")]
  pub gateway_port: u16,
  #[serde(default)]
  pub username: String,
  /// Base64 ciphertext produced by [`CredentialCipher`].
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password: Option<String>,
  #[serde(default)]
  pub otp: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub realm: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_cert: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user_key: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ca_file: Option<String>,
  /// SHA-256 fingerprint of the gateway certificate.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub trusted_cert: Option<String>,
  #[serde(default = "default_true")]
  pub verify_cert: bool,
  #[serde(default = "default_true")]
  pub set_routes: bool,
  #[serde(default = "default_true")]
  pub set_dns: bool,
  #[serde(default = "default_true")]
  pub pppd_use_peerdns: bool,
  #[serde(default)]
  pub insecure_ssl: bool,
  #[serde(default)]
  pub debug: bool,
  #[serde(skip)]
  pub origin: ProfileOrigin,
}

impl VpnProfile {
  pub fn new(name: &str, gateway_host: &str, gateway_port: u16) -> Self {
    Self {
      name: name.to_string(),
      gateway_host: gateway_host.to_string(),
      gateway_port,
      username: String::new(),
      password: None,
      otp: false,
      realm: None,
      user_cert: None,
      user_key: None,
      ca_file: None,
      trusted_cert: None,
      verify_cert: true,
      set_routes: true,
      set_dns: true,
      pppd_use_peerdns: true,
      insecure_ssl: false,
      debug: false,
      origin: ProfileOrigin::Local,
    }
  }

  pub fn is_global(&self) -> bool {
    self.origin == ProfileOrigin::Global
  }

  pub fn set_password(&mut self, plaintext: &str, cipher: &CredentialCipher) {
    self.password = Some(cipher.encrypt(plaintext));
  }

  /// Plaintext password, or an empty string when none was ever stored.
  pub fn decrypt_password(&self, cipher: &CredentialCipher) -> Result<String, CipherError> {
    match &self.password {
      Some(encrypted) if !encrypted.is_empty() => cipher.decrypt(encrypted),
      _ => Ok(String::new()),
    }
  }

  pub fn validate(&self) -> Result<(), VpnError> {
    if self.name.trim().is_empty() {
      return Err(VpnError::InvalidProfile("name must not be empty".to_string()));
    }
    if self.gateway_host.trim().is_empty() {
      return Err(VpnError::InvalidProfile(format!(
        "'{}' has no gateway host",
        self.name
      )));
    }
    if self.gateway_host.starts_with('-') || self.gateway_host.contains(char::is_whitespace) {
      return Err(VpnError::InvalidProfile(format!(
        "'{}' has an invalid gateway host '{}'",
        self.name, self.gateway_host
      )));
    }
    if self.gateway_port == 0 {
      return Err(VpnError::InvalidProfile(format!(
        "'{}' has an invalid gateway port",
        self.name
      )));
    }
    if self.user_cert.is_some() != self.user_key.is_some() {
      return Err(VpnError::InvalidProfile(format!(
        "'{}' needs both a user certificate and a user key",
        self.name
      )));
    }
    Ok(())
  }
}

/// A named, ordered collection of profile references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnGroup {
  pub name: String,
  #[serde(default)]
  pub members: Vec<String>,
}

impl VpnGroup {
  pub fn new(name: &str, members: Vec<String>) -> Self {
    Self {
      name: name.to_string(),
      members,
    }
  }
}

/// Connection state of a single profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
  #[default]
  Disconnected,
  Connecting,
  Connected,
  Error,
}

impl ConnectionState {
  /// A worker exists for this state.
  pub fn is_active(self) -> bool {
    matches!(self, Self::Connecting | Self::Connected)
  }
}

impl std::fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectionState::Disconnected => write!(f, "Disconnected"),
      ConnectionState::Connecting => write!(f, "Connecting"),
      ConnectionState::Connected => write!(f, "Connected"),
      ConnectionState::Error => write!(f, "Error"),
    }
  }
}
