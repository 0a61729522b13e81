//! Profile store integration tests: global profiles, damaged files and group
//! bookkeeping as seen through the public API.

use std::fs;
use tempfile::TempDir;
use vpnkeeper_lib::credential_cipher::CredentialCipher;
use vpnkeeper_lib::vpn::{ProfileOrigin, ProfileStore, VpnError, VpnGroup, VpnProfile};

const GLOBAL_PROFILES: &str = r#"{
  "version": 1,
  "profiles": [
    {"name": "Corp", "gateway_host": "corp.example.com", "gateway_port": 10443, "username": "staff"}
  ],
  "groups": [
    {"name": "Ignored", "members": ["Corp"]}
  ]
}"#;

fn store_with_global(dir: &TempDir) -> ProfileStore {
  let global = dir.path().join("global.json");
  fs::write(&global, GLOBAL_PROFILES).unwrap();
  let (store, error) = ProfileStore::open(&dir.path().join("profiles.json"), Some(&global));
  assert!(error.is_none());
  store
}

#[test]
fn test_global_profiles_are_merged_read_only() {
  let dir = TempDir::new().unwrap();
  let mut store = store_with_global(&dir);
  store
    .add_profile(VpnProfile::new("Office", "vpn.example.com", 443))
    .unwrap();
  let before = fs::read_to_string(store.path()).unwrap();

  let corp = store.profile("Corp").unwrap();
  assert_eq!(corp.origin, ProfileOrigin::Global);
  assert!(store.group("Ignored").is_none());

  let mut edited = corp.clone();
  edited.gateway_port = 443;
  assert!(matches!(
    store.update_profile("Corp", edited),
    Err(VpnError::ImmutableProfile(_))
  ));
  assert!(matches!(
    store.delete_profile("Corp"),
    Err(VpnError::ImmutableProfile(_))
  ));
  assert!(matches!(
    store.set_password("Corp", "pw", CredentialCipher::app()),
    Err(VpnError::ImmutableProfile(_))
  ));

  assert_eq!(store.profile("Corp").unwrap().gateway_port, 10443);
  assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
  assert!(!before.contains("Corp"));
}

#[test]
fn test_global_profile_can_be_copied_and_grouped() {
  let dir = TempDir::new().unwrap();
  let mut store = store_with_global(&dir);

  let copy = store.copy_profile("Corp", "My Corp").unwrap();
  assert_eq!(copy.origin, ProfileOrigin::Local);
  assert_eq!(copy.gateway_host, "corp.example.com");

  store
    .add_group(VpnGroup::new("Work", vec!["Corp".into(), "My Corp".into()]))
    .unwrap();
  let members: Vec<&str> = store
    .group_members("Work")
    .unwrap()
    .iter()
    .map(|p| p.name.as_str())
    .collect();
  assert_eq!(members, vec!["Corp", "My Corp"]);

  let reopened = ProfileStore::load(store.path()).unwrap();
  assert!(reopened.profile("My Corp").is_some());
  assert!(reopened.profile("Corp").is_none());
}

#[test]
fn test_malformed_store_starts_empty_and_is_kept_aside() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("profiles.json");
  fs::write(&path, "{\"profiles\": [ truncated").unwrap();

  let (mut store, error) = ProfileStore::open(&path, None);
  assert!(matches!(error, Some(VpnError::Store(_))));
  assert!(store.profiles().is_empty());
  assert!(dir.path().join("profiles.json.corrupt").exists());

  store
    .add_profile(VpnProfile::new("Office", "vpn.example.com", 443))
    .unwrap();
  let reopened = ProfileStore::load(&path).unwrap();
  assert_eq!(reopened.profiles().len(), 1);
  assert_eq!(
    fs::read_to_string(dir.path().join("profiles.json.corrupt")).unwrap(),
    "{\"profiles\": [ truncated"
  );
}

#[test]
fn test_deleting_member_keeps_group_order() {
  let dir = TempDir::new().unwrap();
  let mut store = ProfileStore::load(&dir.path().join("profiles.json")).unwrap();
  for name in ["A", "B", "C", "D"] {
    store
      .add_profile(VpnProfile::new(name, "vpn.example.com", 443))
      .unwrap();
  }
  store
    .add_group(VpnGroup::new(
      "Ordered",
      vec!["D".into(), "B".into(), "A".into(), "C".into()],
    ))
    .unwrap();
  store
    .add_group(VpnGroup::new("Pair", vec!["B".into(), "C".into()]))
    .unwrap();

  store.delete_profile("B").unwrap();

  let reopened = ProfileStore::load(store.path()).unwrap();
  assert_eq!(
    reopened.group("Ordered").unwrap().members,
    vec!["D".to_string(), "A".to_string(), "C".to_string()]
  );
  assert_eq!(reopened.group("Pair").unwrap().members, vec!["C".to_string()]);
  assert!(reopened.groups_containing("B").is_empty());
}

#[test]
fn test_passwords_are_stored_encrypted() {
  let dir = TempDir::new().unwrap();
  let mut store = ProfileStore::load(&dir.path().join("profiles.json")).unwrap();
  store
    .add_profile(VpnProfile::new("Office", "vpn.example.com", 443))
    .unwrap();
  store
    .set_password("Office", "correct horse", CredentialCipher::app())
    .unwrap();

  let raw = fs::read_to_string(store.path()).unwrap();
  assert!(!raw.contains("correct horse"));

  let reopened = ProfileStore::load(store.path()).unwrap();
  let profile = reopened.profile("Office").unwrap();
  assert_eq!(
    profile.decrypt_password(CredentialCipher::app()).unwrap(),
    "correct horse"
  );
}

#[cfg(unix)]
#[test]
fn test_store_file_is_private() {
  use std::os::unix::fs::PermissionsExt;

  let dir = TempDir::new().unwrap();
  let mut store = ProfileStore::load(&dir.path().join("profiles.json")).unwrap();
  store
    .add_profile(VpnProfile::new("Office", "vpn.example.com", 443))
    .unwrap();

  let mode = fs::metadata(store.path()).unwrap().permissions().mode();
  assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_read_only_load_leaves_damaged_store_in_place() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("profiles.json");
  fs::write(&path, "{\"profiles\": [ truncated").unwrap();

  assert!(matches!(ProfileStore::load(&path), Err(VpnError::Store(_))));
  assert!(path.exists());
  assert!(!dir.path().join("profiles.json.corrupt").exists());

  fs::remove_file(&path).unwrap();
  let global = dir.path().join("global.json");
  fs::write(&global, GLOBAL_PROFILES).unwrap();
  let mut store = ProfileStore::load(&path).unwrap();
  store.merge_global(&global);
  assert_eq!(store.profile("Corp").unwrap().origin, ProfileOrigin::Global);
  assert!(!path.exists());
}
