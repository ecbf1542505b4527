//! Instance lifecycle: create, wait for readiness, destroy.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::backend::{Backend, ServerRequest};
use crate::retry::Deadline;
use crate::session_log::{InstanceLog, Severity};

/// Upper bound on a single TCP connect attempt during the boot probe.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised while provisioning an instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// The create call succeeded but returned no server.
    #[error("control plane returned no instance for {name}")]
    NoInstance {
        /// Name the server was requested with.
        name: String,
    },
    /// The instance did not become active before the deadline.
    #[error("instance {instance_id} was not ready in time")]
    ReadinessTimeout {
        /// Provider identifier.
        instance_id: String,
        /// Last fault message reported, if any.
        fault: Option<String>,
    },
    /// The provider moved the instance to an error state.
    #[error("instance {instance_id} failed to build: {fault}")]
    Faulted {
        /// Provider identifier.
        instance_id: String,
        /// Fault message reported by the provider.
        fault: String,
    },
    /// The instance became active without an address on the test network.
    #[error("instance {instance_id} has no address on network {network}")]
    MissingAddress {
        /// Provider identifier.
        instance_id: String,
        /// Network that was expected to carry an address.
        network: String,
    },
    /// A control-plane call failed.
    #[error("{action} failed: {message}")]
    ControlPlane {
        /// Operation that failed.
        action: String,
        /// Error reported by the backend.
        message: String,
    },
    /// The request was incomplete.
    #[error("invalid server request: missing {0}")]
    InvalidRequest(String),
}

impl ProvisionError {
    fn control_plane(action: &str, err: &impl std::error::Error) -> Self {
        Self::ControlPlane {
            action: action.to_owned(),
            message: err.to_string(),
        }
    }
}

/// Waits applied while provisioning.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProvisionTimings {
    /// Deadline for the instance to report active.
    pub readiness_timeout: Duration,
    /// Pause between status polls.
    pub poll_interval: Duration,
    /// Ceiling on waiting for the guest to accept TCP connections.
    pub boot_grace: Duration,
    /// Pause between boot probe attempts.
    pub probe_interval: Duration,
}

impl Default for ProvisionTimings {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(1),
            boot_grace: Duration::from_secs(30),
            probe_interval: Duration::from_secs(1),
        }
    }
}

/// A server owned by a session, paired with its log from creation on.
#[derive(Debug)]
pub struct Instance {
    id: String,
    name: String,
    address: Option<IpAddr>,
    log: InstanceLog,
}

impl Instance {
    /// Provider identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address on the test network once the instance is ready.
    #[must_use]
    pub const fn address(&self) -> Option<IpAddr> {
        self.address
    }

    /// Log this instance writes to.
    #[must_use]
    pub const fn log(&self) -> &InstanceLog {
        &self.log
    }
}

/// Creates, readies and destroys instances through a [`Backend`].
#[derive(Debug)]
pub struct InstanceProvisioner<'b, B: Backend> {
    backend: &'b B,
    network: String,
    ssh_port: u16,
    timings: ProvisionTimings,
}

impl<'b, B: Backend> InstanceProvisioner<'b, B> {
    /// Creates a provisioner that reads addresses from `network` and probes
    /// `ssh_port` during boot.
    #[must_use]
    pub fn new(
        backend: &'b B,
        network: impl Into<String>,
        ssh_port: u16,
        timings: ProvisionTimings,
    ) -> Self {
        Self {
            backend,
            network: network.into(),
            ssh_port,
            timings,
        }
    }

    /// Requests a server. Does not wait for it to become ready.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NoInstance`] when the control plane returns
    /// nothing, [`ProvisionError::InvalidRequest`] for incomplete requests
    /// and [`ProvisionError::ControlPlane`] when the call fails.
    pub async fn create(
        &self,
        request: &ServerRequest,
        log: InstanceLog,
    ) -> Result<Instance, ProvisionError> {
        request
            .validate()
            .map_err(|err| ProvisionError::InvalidRequest(err.to_string()))?;

        let handle = self
            .backend
            .create_server(request)
            .await
            .map_err(|err| ProvisionError::control_plane("create_server", &err))?
            .ok_or_else(|| ProvisionError::NoInstance {
                name: request.name.clone(),
            })?;

        tracing::info!(instance_id = %handle.id, name = %handle.name, "instance requested");
        log.info(&format!("Created instance '{}' ({}).", handle.name, handle.id));
        Ok(Instance {
            id: handle.id,
            name: handle.name,
            address: None,
            log,
        })
    }

    /// Polls until the instance is active with an address, then waits for
    /// the guest to accept connections on the SSH port.
    ///
    /// The boot probe never fails: once the grace period runs out the
    /// session proceeds and relies on SSH retries.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ReadinessTimeout`],
    /// [`ProvisionError::Faulted`] or [`ProvisionError::MissingAddress`]
    /// when the instance never becomes usable. The fault detail is logged
    /// before returning.
    pub async fn await_ready(&self, instance: &mut Instance) -> Result<IpAddr, ProvisionError> {
        let address = match self.poll_until_active(instance).await {
            Ok(address) => address,
            Err(err) => {
                let fault = match &err {
                    ProvisionError::ReadinessTimeout { fault, .. } => fault.clone(),
                    ProvisionError::Faulted { fault, .. } => Some(fault.clone()),
                    _ => None,
                };
                instance.log.error(&format!(
                    "Instance fault: {}",
                    fault.as_deref().unwrap_or("none reported")
                ));
                return Err(err);
            }
        };
        instance.address = Some(address);

        instance.log.announce(
            Severity::Info,
            &format!(
                "Waiting up to {} seconds for OS startup...",
                self.timings.boot_grace.as_secs()
            ),
        );
        if self.probe_boot(SocketAddr::new(address, self.ssh_port)).await {
            instance.log.info("Instance accepted a connection on the SSH port.");
        } else {
            instance.log.warn(&format!(
                "No connection on port {} within the boot grace period; continuing.",
                self.ssh_port
            ));
        }
        Ok(address)
    }

    async fn poll_until_active(&self, instance: &Instance) -> Result<IpAddr, ProvisionError> {
        let deadline = Deadline::after(self.timings.readiness_timeout);
        let mut last_fault = None;
        loop {
            let server = self
                .backend
                .fetch_server(&instance.id)
                .await
                .map_err(|err| ProvisionError::control_plane("fetch_server", &err))?;

            if let Some(server) = server {
                if server.is_faulted() {
                    return Err(ProvisionError::Faulted {
                        instance_id: instance.id.clone(),
                        fault: server
                            .fault
                            .unwrap_or_else(|| String::from("unknown fault")),
                    });
                }
                if server.is_active() {
                    if let Some(address) = server.address_on(&self.network) {
                        return Ok(address);
                    }
                    if deadline.has_passed() {
                        return Err(ProvisionError::MissingAddress {
                            instance_id: instance.id.clone(),
                            network: self.network.clone(),
                        });
                    }
                }
                last_fault = server.fault.or(last_fault);
            }

            if deadline.has_passed() {
                return Err(ProvisionError::ReadinessTimeout {
                    instance_id: instance.id.clone(),
                    fault: last_fault,
                });
            }
            sleep(self.timings.poll_interval).await;
        }
    }

    async fn probe_boot(&self, addr: SocketAddr) -> bool {
        let deadline = Deadline::after(self.timings.boot_grace);
        loop {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return false;
            }
            let attempt = timeout(
                remaining.min(PROBE_CONNECT_TIMEOUT),
                TcpStream::connect(addr),
            )
            .await;
            if matches!(attempt, Ok(Ok(_))) {
                return true;
            }
            sleep(self.timings.probe_interval.min(remaining)).await;
        }
    }

    /// Deletes the instance. Failures are logged, never returned.
    pub async fn destroy(&self, instance: Instance) {
        match self.backend.delete_server(&instance.id).await {
            Ok(()) => {
                tracing::info!(instance_id = %instance.id, "instance destroyed");
                instance
                    .log
                    .info(&format!("Destroyed instance '{}'.", instance.id));
            }
            Err(err) => {
                tracing::error!(instance_id = %instance.id, error = %err, "instance teardown failed");
                instance.log.error(&format!(
                    "Failed to destroy instance '{}': {err}",
                    instance.id
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScratchLog;
    use crate::test_support::{FAKE_SERVER_ADDRESS, FakeCloud, ServerBehaviour};
    use rstest::rstest;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn timings() -> ProvisionTimings {
        ProvisionTimings {
            readiness_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
            boot_grace: Duration::ZERO,
            probe_interval: Duration::from_millis(1),
        }
    }

    fn request(name: &str) -> ServerRequest {
        ServerRequest {
            name: name.to_owned(),
            flavor_id: String::from("flavor-1"),
            image_id: String::from("image-1"),
            network_id: String::from("net-1"),
            keypair: String::from("ci"),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn create_returns_instance_paired_with_log() {
        let scratch = ScratchLog::new();
        let cloud = FakeCloud::new();
        let provisioner = InstanceProvisioner::new(&cloud, "public", 22, timings());

        let instance = provisioner
            .create(&request("taster-x-ubuntu"), scratch.log.clone())
            .await
            .expect("create");

        assert_eq!(instance.name(), "taster-x-ubuntu");
        assert_eq!(instance.address(), None);
        assert_eq!(instance.log().path(), scratch.log.path());
        assert_eq!(cloud.created().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn create_without_server_is_a_provision_error() {
        let scratch = ScratchLog::new();
        let cloud = FakeCloud::new().with_servers(ServerBehaviour::ReturnsNothing);
        let provisioner = InstanceProvisioner::new(&cloud, "public", 22, timings());

        let err = provisioner
            .create(&request("taster-x-ubuntu"), scratch.log.clone())
            .await
            .expect_err("no instance");

        assert_eq!(
            err,
            ProvisionError::NoInstance {
                name: String::from("taster-x-ubuntu")
            }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn await_ready_polls_until_active() {
        let scratch = ScratchLog::new();
        let cloud = FakeCloud::new().with_servers(ServerBehaviour::BootsAfter(3));
        let provisioner = InstanceProvisioner::new(&cloud, "public", 22, timings());
        let mut instance = provisioner
            .create(&request("vm"), scratch.log.clone())
            .await
            .expect("create");

        let address = provisioner
            .await_ready(&mut instance)
            .await
            .expect("ready");

        assert_eq!(address, FAKE_SERVER_ADDRESS);
        assert_eq!(instance.address(), Some(FAKE_SERVER_ADDRESS));
        assert!(
            scratch
                .console
                .contents()
                .contains("Waiting up to 0 seconds for OS startup...")
        );
    }

    #[rstest]
    #[tokio::test]
    async fn await_ready_accepts_unbounded_readiness_timeout() {
        let scratch = ScratchLog::new();
        let cloud = FakeCloud::new().with_servers(ServerBehaviour::BootsAfter(2));
        let provisioner = InstanceProvisioner::new(
            &cloud,
            "public",
            22,
            ProvisionTimings {
                readiness_timeout: Duration::from_secs(u64::MAX),
                ..timings()
            },
        );
        let mut instance = provisioner
            .create(&request("vm"), scratch.log.clone())
            .await
            .expect("create");

        let address = provisioner
            .await_ready(&mut instance)
            .await
            .expect("ready");

        assert_eq!(address, FAKE_SERVER_ADDRESS);
    }

    #[rstest]
    #[tokio::test]
    async fn await_ready_times_out_and_logs_fault() {
        let scratch = ScratchLog::new();
        let cloud = FakeCloud::new().with_servers(ServerBehaviour::NeverReady);
        let provisioner = InstanceProvisioner::new(&cloud, "public", 22, timings());
        let mut instance = provisioner
            .create(&request("vm"), scratch.log.clone())
            .await
            .expect("create");

        let err = provisioner
            .await_ready(&mut instance)
            .await
            .expect_err("timeout");

        assert!(matches!(err, ProvisionError::ReadinessTimeout { .. }));
        assert!(
            scratch
                .messages()
                .iter()
                .any(|message| message.starts_with("Instance fault:"))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn await_ready_reports_provider_fault() {
        let scratch = ScratchLog::new();
        let cloud = FakeCloud::new()
            .with_servers(ServerBehaviour::Faults(String::from("No valid host was found")));
        let provisioner = InstanceProvisioner::new(&cloud, "public", 22, timings());
        let mut instance = provisioner
            .create(&request("vm"), scratch.log.clone())
            .await
            .expect("create");

        let err = provisioner
            .await_ready(&mut instance)
            .await
            .expect_err("fault");

        assert!(matches!(err, ProvisionError::Faulted { ref fault, .. } if fault == "No valid host was found"));
        assert!(
            scratch
                .messages()
                .contains(&String::from("Instance fault: No valid host was found"))
        );
    }

    #[rstest]
    #[tokio::test]
    async fn await_ready_rejects_active_server_without_address_on_network() {
        let scratch = ScratchLog::new();
        let cloud = FakeCloud::new();
        let provisioner = InstanceProvisioner::new(&cloud, "private", 22, timings());
        let mut instance = provisioner
            .create(&request("vm"), scratch.log.clone())
            .await
            .expect("create");

        let err = provisioner
            .await_ready(&mut instance)
            .await
            .expect_err("no address");

        assert!(matches!(err, ProvisionError::MissingAddress { ref network, .. } if network == "private"));
    }

    #[tokio::test]
    async fn boot_probe_returns_once_port_listens() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener addr: {err}"));
        tokio::spawn(async move { if let Ok((_stream, _addr)) = listener.accept().await {} });

        let cloud = FakeCloud::new();
        let provisioner = InstanceProvisioner::new(
            &cloud,
            "public",
            addr.port(),
            ProvisionTimings {
                boot_grace: Duration::from_secs(5),
                ..timings()
            },
        );

        let started = Instant::now();
        assert!(provisioner.probe_boot(addr).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn boot_probe_gives_up_at_grace_ceiling() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener addr: {err}"));
        drop(listener);

        let cloud = FakeCloud::new();
        let provisioner = InstanceProvisioner::new(
            &cloud,
            "public",
            addr.port(),
            ProvisionTimings {
                boot_grace: Duration::from_millis(50),
                ..timings()
            },
        );

        assert!(!provisioner.probe_boot(addr).await);
    }

    #[rstest]
    #[tokio::test]
    async fn destroy_swallows_backend_failures() {
        let scratch = ScratchLog::new();
        let cloud = FakeCloud::new().failing_delete();
        let provisioner = InstanceProvisioner::new(&cloud, "public", 22, timings());
        let instance = provisioner
            .create(&request("vm"), scratch.log.clone())
            .await
            .expect("create");
        let id = instance.id().to_owned();

        provisioner.destroy(instance).await;

        assert_eq!(cloud.deleted(), vec![id]);
        assert!(
            scratch
                .messages()
                .iter()
                .any(|message| message.starts_with("Failed to destroy instance"))
        );
    }
}
