//! VPN profiles, their store, and supervision of the tunnel worker.
//!
//! - `config`: profile, group and state types
//! - `storage`: the JSON profile store
//! - `worker`: the privileged `openfortivpn` process
//! - `supervisor`: connection state machine around the worker
//! - `status`: read-only reporting for front ends

mod config;
pub mod status;
mod storage;
mod supervisor;
pub mod worker;

pub use config::{ConnectionState, ProfileOrigin, VpnError, VpnGroup, VpnProfile};
pub use status::StatusReporter;
pub use storage::ProfileStore;
pub use supervisor::{ProfileStatus, Supervisor, SupervisorConfig, SupervisorEvent};
