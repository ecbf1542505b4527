//! Core library for the taster image-validation tool.
//!
//! A session resolves an image, boots an ephemeral OpenStack instance from
//! it, runs a compliance suite and a volume attach/mount workflow against
//! it, snapshots the instance if anything failed, and always destroys it
//! (create → wait for SSH readiness → test → conclude → destroy).

pub mod backend;
pub mod compliance;
pub mod config;
pub mod openstack;
pub mod provision;
pub mod retry;
pub mod session;
pub mod session_log;
pub mod ssh;
#[cfg(test)]
pub mod test_helpers;
pub mod test_support;
pub mod volumes;

pub use backend::{Backend, BackendError, ServerRequest, VolumeBackend};
pub use compliance::{ComplianceSuite, ComplianceTestRunner, InspecSuite, SuiteFallback};
pub use config::{ConfigError, OpenStackConfig, TasterConfig};
pub use openstack::{OpenStackBackend, OpenStackError};
pub use provision::{Instance, InstanceProvisioner, ProvisionTimings};
pub use retry::RetryPolicy;
pub use session::{SessionConfig, SessionError, SessionOrchestrator, Settings};
pub use session_log::{Console, InstanceLog, LogEntry, SessionLog, Severity};
pub use ssh::{CommandRunner, ProcessCommandRunner, RemoteError, SshConnector, SshOptions};
pub use volumes::{VolumeReport, VolumeTestEngine};
