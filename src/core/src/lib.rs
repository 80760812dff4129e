//! vmbridge core - handles, queues and shared types.
//!
//! Leaf utilities of the VM bridge: the handle registry that turns native
//! callbacks into awaitable results, the per-VM dispatch queue, the error
//! taxonomy, configuration and the telemetry event emitter.

pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod queue;
pub mod telemetry;

// Re-export commonly used types
pub use config::{BridgeConfig, DatapathConfig, IpcConfig, LifecycleConfig, LogSettings};
pub use error::{BridgeError, Result, RichError};
pub use event::{BridgeEvent, EventEmitter};
pub use handle::{Handle, HandleRegistry, Pending};
pub use queue::{DispatchQueue, QueueStatus};

/// vmbridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
