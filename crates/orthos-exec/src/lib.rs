//! orthos-exec: Command transport for out-of-band channels
//!
//! Runs commands locally (BMC tooling such as `ipmitool`) or on remote
//! management hosts via SSH (serial console concentrator, provisioning server).

pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use keys::{KeyError, KeySource, ResolvedKey};
pub use local::LocalExecutor;
pub use result::CommandResult;
pub use ssh::{ConnectionInfo, SshExecutor};
pub use traits::RemoteExecutor;
