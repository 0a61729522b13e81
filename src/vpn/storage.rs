//! Durable store for VPN profiles and groups.

use super::config::{VpnError, VpnGroup, VpnProfile};
use super::ProfileOrigin;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Storage format version for migration support
const STORAGE_VERSION: u32 = 1;

fn default_version() -> u32 {
  STORAGE_VERSION
}

/// Store file layout
#[derive(Debug, Serialize, Deserialize)]
struct StoreData {
  #[serde(default = "default_version")]
  version: u32,
  #[serde(default)]
  profiles: Vec<VpnProfile>,
  #[serde(default)]
  groups: Vec<VpnGroup>,
}

impl Default for StoreData {
  fn default() -> Self {
    Self {
      version: STORAGE_VERSION,
      profiles: Vec::new(),
      groups: Vec::new(),
    }
  }
}

/// Profiles and groups backed by a JSON file.
///
/// Every mutating call persists before returning `Ok`. If persisting fails the
/// in-memory change is rolled back, so memory and disk never disagree.
#[derive(Debug)]
pub struct ProfileStore {
  storage_path: PathBuf,
  profiles: Vec<VpnProfile>,
  groups: Vec<VpnGroup>,
}

impl ProfileStore {
  /// Empty store that will persist to `path`.
  pub fn empty(path: &Path) -> Self {
    Self {
      storage_path: path.to_path_buf(),
      profiles: Vec::new(),
      groups: Vec::new(),
    }
  }

  /// Load the local store. A missing file is an empty store.
  pub fn load(path: &Path) -> Result<Self, VpnError> {
    let data = read_store_file(path)?;
    let mut store = Self::empty(path);
    store.absorb(data, ProfileOrigin::Local);
    Ok(store)
  }

  /// Load the local store and merge the machine-wide profiles.
  ///
  /// Never fails: a malformed local file yields an empty store together with
  /// the error, and the unreadable file is moved aside so the next save does
  /// not destroy it.
  pub fn open(path: &Path, global_path: Option<&Path>) -> (Self, Option<VpnError>) {
    let (mut store, error) = match Self::load(path) {
      Ok(store) => (store, None),
      Err(e) => {
        log::error!("[store] {e}; starting with an empty store");
        let aside = corrupt_path(path);
        match fs::rename(path, &aside) {
          Ok(()) => log::warn!("[store] Moved unreadable store to {}", aside.display()),
          Err(rename_err) => log::warn!("[store] Could not move unreadable store aside: {rename_err}"),
        }
        (Self::empty(path), Some(e))
      }
    };

    if let Some(global_path) = global_path {
      store.merge_global(global_path);
    }

    (store, error)
  }

  /// Add the read-only machine-wide profiles. An unreadable file is logged
  /// and contributes nothing.
  pub fn merge_global(&mut self, global_path: &Path) {
    match read_store_file(global_path) {
      Ok(data) => self.absorb(data, ProfileOrigin::Global),
      Err(e) => log::warn!("[store] Ignoring global profiles: {e}"),
    }
  }

  fn absorb(&mut self, data: StoreData, origin: ProfileOrigin) {
    for mut profile in data.profiles {
      if self.profile(&profile.name).is_some() {
        log::warn!(
          "[store] Skipping duplicate profile '{}' from {:?} source",
          profile.name,
          origin
        );
        continue;
      }
      profile.origin = origin;
      self.profiles.push(profile);
    }

    // Groups are operator data; the global file only contributes profiles.
    if origin == ProfileOrigin::Local {
      for mut group in data.groups {
        if self.group(&group.name).is_some() {
          log::warn!("[store] Skipping duplicate group '{}'", group.name);
          continue;
        }
        dedup_members(&mut group.members);
        self.groups.push(group);
      }
    }
  }

  pub fn path(&self) -> &Path {
    &self.storage_path
  }

  /// Stage to a temp file next to the target, then atomically replace it.
  pub fn save(&self) -> Result<(), VpnError> {
    let data = StoreData {
      version: STORAGE_VERSION,
      profiles: self
        .profiles
        .iter()
        .filter(|p| !p.is_global())
        .cloned()
        .collect(),
      groups: self.groups.clone(),
    };
    let content = serde_json::to_string_pretty(&data)
      .map_err(|e| VpnError::Store(format!("Failed to serialize storage: {e}")))?;

    let dir = match self.storage_path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
      _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
      .map_err(|e| VpnError::Store(format!("Failed to create storage directory: {e}")))?;

    let mut staged = tempfile::NamedTempFile::new_in(&dir)
      .map_err(|e| VpnError::Store(format!("Failed to stage storage file: {e}")))?;
    staged
      .write_all(content.as_bytes())
      .and_then(|()| staged.as_file().sync_all())
      .map_err(|e| VpnError::Store(format!("Failed to write storage file: {e}")))?;

    // Encrypted or not, credentials stay private to the operator
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let _ = fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o600));
    }

    staged
      .persist(&self.storage_path)
      .map_err(|e| VpnError::Store(format!("Failed to replace storage file: {}", e.error)))?;

    log::debug!("[store] Saved {}", self.storage_path.display());
    Ok(())
  }

  fn mutate<T>(
    &mut self,
    change: impl FnOnce(&mut Self) -> Result<T, VpnError>,
  ) -> Result<T, VpnError> {
    let profiles = self.profiles.clone();
    let groups = self.groups.clone();

    let result = change(self).and_then(|value| self.save().map(|()| value));
    if result.is_err() {
      self.profiles = profiles;
      self.groups = groups;
    }
    result
  }

  // ---- lookups ----

  pub fn profiles(&self) -> &[VpnProfile] {
    &self.profiles
  }

  pub fn groups(&self) -> &[VpnGroup] {
    &self.groups
  }

  pub fn profile(&self, name: &str) -> Option<&VpnProfile> {
    self.profiles.iter().find(|p| p.name == name)
  }

  pub fn group(&self, name: &str) -> Option<&VpnGroup> {
    self.groups.iter().find(|g| g.name == name)
  }

  pub fn groups_containing(&self, profile_name: &str) -> Vec<&VpnGroup> {
    self
      .groups
      .iter()
      .filter(|g| g.members.iter().any(|m| m == profile_name))
      .collect()
  }

  /// Members of a group that currently resolve to a profile, in group order.
  pub fn group_members(&self, group_name: &str) -> Result<Vec<&VpnProfile>, VpnError> {
    let group = self
      .group(group_name)
      .ok_or_else(|| VpnError::NotFound(group_name.to_string()))?;
    Ok(group.members.iter().filter_map(|m| self.profile(m)).collect())
  }

  fn local_profile_index(&self, name: &str) -> Result<usize, VpnError> {
    let pos = self
      .profiles
      .iter()
      .position(|p| p.name == name)
      .ok_or_else(|| VpnError::NotFound(name.to_string()))?;
    if self.profiles[pos].is_global() {
      return Err(VpnError::ImmutableProfile(name.to_string()));
    }
    Ok(pos)
  }

  fn group_index(&self, name: &str) -> Result<usize, VpnError> {
    self
      .groups
      .iter()
      .position(|g| g.name == name)
      .ok_or_else(|| VpnError::NotFound(name.to_string()))
  }

  // ---- profiles ----

  pub fn add_profile(&mut self, mut profile: VpnProfile) -> Result<(), VpnError> {
    profile.validate()?;
    if self.profile(&profile.name).is_some() {
      return Err(VpnError::Duplicate(profile.name));
    }
    profile.origin = ProfileOrigin::Local;
    let name = profile.name.clone();
    self.mutate(|store| {
      store.profiles.push(profile);
      Ok(())
    })?;
    log::info!("[store] Added VPN '{name}'");
    Ok(())
  }

  /// Replace profile `name`. A changed name is followed by every group.
  pub fn update_profile(&mut self, name: &str, mut profile: VpnProfile) -> Result<(), VpnError> {
    let pos = self.local_profile_index(name)?;
    profile.validate()?;
    if profile.name != name && self.profile(&profile.name).is_some() {
      return Err(VpnError::Duplicate(profile.name));
    }
    profile.origin = ProfileOrigin::Local;

    self.mutate(|store| {
      if profile.name != name {
        for group in &mut store.groups {
          for member in group.members.iter_mut().filter(|m| m.as_str() == name) {
            *member = profile.name.clone();
          }
        }
      }
      store.profiles[pos] = profile;
      Ok(())
    })?;
    log::info!("[store] Updated VPN '{name}'");
    Ok(())
  }

  /// Delete profile `name` and drop it from every group.
  pub fn delete_profile(&mut self, name: &str) -> Result<VpnProfile, VpnError> {
    let pos = self.local_profile_index(name)?;
    let removed = self.mutate(|store| {
      for group in &mut store.groups {
        group.members.retain(|m| m != name);
      }
      Ok(store.profiles.remove(pos))
    })?;
    log::info!("[store] Deleted VPN '{name}'");
    Ok(removed)
  }

  /// Duplicate a profile (local or global) under a new local name.
  pub fn copy_profile(&mut self, name: &str, new_name: &str) -> Result<VpnProfile, VpnError> {
    let mut copy = self
      .profile(name)
      .cloned()
      .ok_or_else(|| VpnError::NotFound(name.to_string()))?;
    copy.name = new_name.to_string();
    self.add_profile(copy.clone())?;
    copy.origin = ProfileOrigin::Local;
    Ok(copy)
  }

  pub fn set_password(
    &mut self,
    name: &str,
    plaintext: &str,
    cipher: &crate::credential_cipher::CredentialCipher,
  ) -> Result<(), VpnError> {
    let pos = self.local_profile_index(name)?;
    self.mutate(|store| {
      store.profiles[pos].set_password(plaintext, cipher);
      Ok(())
    })
  }

  // ---- groups ----

  fn check_members(&self, group: &mut VpnGroup) -> Result<(), VpnError> {
    if group.name.trim().is_empty() {
      return Err(VpnError::InvalidProfile(
        "group name must not be empty".to_string(),
      ));
    }
    dedup_members(&mut group.members);
    if let Some(missing) = group.members.iter().find(|m| self.profile(m).is_none()) {
      return Err(VpnError::NotFound(missing.clone()));
    }
    Ok(())
  }

  pub fn add_group(&mut self, mut group: VpnGroup) -> Result<(), VpnError> {
    if self.group(&group.name).is_some() {
      return Err(VpnError::Duplicate(group.name));
    }
    self.check_members(&mut group)?;
    let name = group.name.clone();
    self.mutate(|store| {
      store.groups.push(group);
      Ok(())
    })?;
    log::info!("[store] Added VPN group '{name}'");
    Ok(())
  }

  pub fn update_group(&mut self, name: &str, mut group: VpnGroup) -> Result<(), VpnError> {
    let pos = self.group_index(name)?;
    if group.name != name && self.group(&group.name).is_some() {
      return Err(VpnError::Duplicate(group.name));
    }
    self.check_members(&mut group)?;
    self.mutate(|store| {
      store.groups[pos] = group;
      Ok(())
    })?;
    log::info!("[store] Updated VPN group '{name}'");
    Ok(())
  }

  pub fn delete_group(&mut self, name: &str) -> Result<VpnGroup, VpnError> {
    let pos = self.group_index(name)?;
    let removed = self.mutate(|store| Ok(store.groups.remove(pos)))?;
    log::info!("[store] Deleted VPN group '{name}'");
    Ok(removed)
  }

  pub fn copy_group(&mut self, name: &str, new_name: &str) -> Result<VpnGroup, VpnError> {
    let mut copy = self
      .group(name)
      .cloned()
      .ok_or_else(|| VpnError::NotFound(name.to_string()))?;
    copy.name = new_name.to_string();
    self.add_group(copy.clone())?;
    Ok(copy)
  }
}

fn read_store_file(path: &Path) -> Result<StoreData, VpnError> {
  if !path.exists() {
    return Ok(StoreData::default());
  }

  let content = fs::read_to_string(path)
    .map_err(|e| VpnError::Store(format!("Failed to read storage file: {e}")))?;

  let data: StoreData = serde_json::from_str(&content)
    .map_err(|e| VpnError::Store(format!("Failed to parse storage file: {e}")))?;
  if data.version > STORAGE_VERSION {
    log::warn!(
      "[store] {} was written by a newer version ({}), unknown fields are ignored",
      path.display(),
      data.version
    );
  }
  Ok(data)
}

fn corrupt_path(path: &Path) -> PathBuf {
  let mut name = path
    .file_name()
    .map(|n| n.to_os_string())
    .unwrap_or_default();
  name.push(".corrupt");
  path.with_file_name(name)
}

fn dedup_members(members: &mut Vec<String>) {
  let mut seen = std::collections::HashSet::new();
  members.retain(|m| seen.insert(m.clone()));
}
