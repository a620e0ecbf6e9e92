//! tund Network Layer
//!
//! Idempotent primitives that bring host networking back to its
//! pre-tunnel state.
//!
//! Architecture:
//! 1. `Platform` wraps the OS tools (`ip`, `resolvectl`, `networksetup`, `netsh`)
//! 2. `NetworkCleaner` sequences those calls and never aborts half way
//! 3. `NetworkOverride` records what one tunnel changed, so teardown
//!    can undo exactly that and leave other tunnels alone

mod cleaner;
mod error;
mod exec;
mod overrides;
pub mod platform;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cleaner::{CleanerConfig, NetworkCleaner};
pub use error::PlatformError;
pub use overrides::{NetworkOverride, Route};
pub use platform::Platform;
