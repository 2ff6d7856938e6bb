//! Container lifecycle.
//!
//! - `state`: lifecycle states
//! - `record`: persisted records, filters and names
//! - `process`: process launching and supervision
//! - `manager`: the per-container state machine

mod manager;
pub mod process;
mod record;
mod state;

pub use manager::{ContainerManager, KILL_GRACE};
pub use process::{
    ExecOutput, HostLauncher, NamespaceSet, ProcessHandle, ProcessLauncher, ProcessSpec,
};
pub use record::{
    generate_name, ContainerConfig, ContainerFilter, ContainerRecord, ContainerSummary,
};
pub use state::ContainerState;
