//! Virtual machine configuration and lifecycle.

pub mod config;
mod install;
pub(crate) mod machine;
pub mod state;

pub use config::VirtualMachineConfig;
pub use install::MacOsInstaller;
pub use machine::VirtualMachine;
pub use state::{StateSubscription, VmState};
