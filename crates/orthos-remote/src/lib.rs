//! orthos-remote: Remote control adapters for out-of-band channels
//!
//! Every channel (BMC power, serial console, provisioning server) sits behind
//! the same [`RemoteControl`] trait and reports each call as success,
//! transient failure, or permanent failure. Reachability probing for the
//! reconciler lives here as well, behind [`Prober`].

pub mod console;
pub mod error;
pub mod power;
pub mod probe;
pub mod provision;
pub mod registry;
pub mod template;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use console::{ConsoleCommands, SerialConsoleAdapter};
pub use error::RemoteError;
pub use power::IpmiPowerAdapter;
pub use probe::{PingProber, TcpProber};
pub use provision::{ProvisionAdapter, ProvisionCommands};
pub use registry::AdapterRegistry;
pub use traits::{Prober, RemoteControl};
pub use types::{Channel, Outcome, ProbeOutcome, RemoteAction, Target};
