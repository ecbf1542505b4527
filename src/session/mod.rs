//! End-to-end tasting of one image: resolve, provision, test, conclude and
//! tear down.
//!
//! The orchestrator guarantees that an instance it created is destroyed
//! before [`SessionOrchestrator::taste`] returns, whatever happened in
//! between, including cancellation.

use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backend::{NamedResource, ServerRequest, VolumeBackend};
use crate::compliance::{ComplianceSuite, ComplianceTestRunner, ConnectionOptions, SuiteFallback};
use crate::provision::{Instance, InstanceProvisioner, ProvisionTimings};
use crate::retry::{Deadline, RetryPolicy};
use crate::session_log::{Console, InstanceLog, LogError, SessionLog, Severity};
use crate::ssh::{CommandRunner, RemoteError, SSH_CONTEXT, SshConnector, SshTarget};
use crate::volumes::{MountSettings, VolumeSuiteError, VolumeTestEngine, VolumeTimings};

mod naming;

pub use naming::{
    INSTANCE_NAME_PREFIX, SessionId, TIME_SLUG_FORMAT, distro_tag, instance_name, snapshot_name,
};

/// Image status that marks a finished snapshot.
const IMAGE_ACTIVE: &str = "active";

/// Image statuses from which a snapshot never becomes usable.
const IMAGE_DEAD: [&str; 2] = ["killed", "deleted"];

/// Which suites run and what happens on failure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Settings {
    /// Login user on the image.
    pub ssh_user: String,
    /// Run the compliance suite.
    pub security: bool,
    /// Run the volume workflow.
    pub volumes: bool,
    /// Snapshot the instance when a suite fails.
    pub create_snapshot: bool,
}

/// Everything a session needs besides its collaborators.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionConfig {
    /// Root under which session log directories are created.
    pub log_dir: Utf8PathBuf,
    /// Flavor name for the instance.
    pub flavor: String,
    /// Network name the instance is attached to and reached through.
    pub network: String,
    /// Keypair injected into the instance.
    pub keypair: String,
    /// Private key matching `keypair`.
    pub identity_file: Utf8PathBuf,
    /// SSH port on the instance.
    pub ssh_port: u16,
    /// Location of the compliance profile.
    pub suite_path: Utf8PathBuf,
    /// Verdict when the compliance suite cannot run.
    pub suite_fallback: SuiteFallback,
    /// Severity name the compliance results are logged at.
    pub results_severity: String,
    /// Retry policy for SSH and suite connections.
    pub ssh_retry: RetryPolicy,
    /// Instance readiness waits.
    pub provision: ProvisionTimings,
    /// Volume attachment waits.
    pub volume_timings: VolumeTimings,
    /// In-guest mount verification settings.
    pub mount: MountSettings,
    /// Deadline for a snapshot to become active.
    pub snapshot_timeout: Duration,
    /// Pause between snapshot status polls.
    pub poll_interval: Duration,
}

/// Phases a session moves through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    /// Looking up the image, flavor and network.
    Resolving,
    /// Requesting the instance.
    Provisioning,
    /// Waiting for the instance to boot.
    AwaitingReady,
    /// Running the selected suites.
    Testing,
    /// Deciding on and taking a snapshot.
    Concluding,
    /// The instance has been torn down.
    Destroyed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::Provisioning => "provisioning",
            Self::AwaitingReady => "awaiting-ready",
            Self::Testing => "testing",
            Self::Concluding => "concluding",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Errors that end a session without a pass/fail verdict.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No image has the requested name.
    #[error("{name} is not an available image.")]
    ImageNotFound {
        /// Requested image name.
        name: String,
    },
    /// No flavor has the configured name.
    #[error("{name} is not an available flavor.")]
    FlavorNotFound {
        /// Configured flavor name.
        name: String,
    },
    /// No network has the configured name.
    #[error("{name} is not an available network.")]
    NetworkNotFound {
        /// Configured network name.
        name: String,
    },
    /// A control-plane lookup failed.
    #[error("{action} failed: {message}")]
    ControlPlane {
        /// Operation that failed.
        action: String,
        /// Error reported by the backend.
        message: String,
    },
    /// The session log could not be prepared.
    #[error(transparent)]
    Log(#[from] LogError),
    /// The instance stopped accepting SSH connections.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// The session was interrupted; the instance was torn down first.
    #[error("session cancelled")]
    Cancelled,
}

impl SessionError {
    fn control_plane(action: &str, err: &impl std::error::Error) -> Self {
        Self::ControlPlane {
            action: action.to_owned(),
            message: err.to_string(),
        }
    }
}

/// Tastes images one session at a time.
///
/// The orchestrator holds only shared handles, so several sessions may run
/// concurrently through the same value.
#[derive(Debug)]
pub struct SessionOrchestrator<'a, B, R, S>
where
    B: VolumeBackend,
    R: CommandRunner,
    S: ComplianceSuite + ?Sized,
{
    backend: &'a B,
    connector: &'a SshConnector<R>,
    suite: &'a S,
    config: &'a SessionConfig,
    console: Console,
}

struct Resolved {
    image: NamedResource,
    flavor: NamedResource,
    network: NamedResource,
}

impl<'a, B, R, S> SessionOrchestrator<'a, B, R, S>
where
    B: VolumeBackend,
    R: CommandRunner,
    S: ComplianceSuite + ?Sized,
{
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(
        backend: &'a B,
        connector: &'a SshConnector<R>,
        suite: &'a S,
        config: &'a SessionConfig,
        console: Console,
    ) -> Self {
        Self {
            backend,
            connector,
            suite,
            config,
            console,
        }
    }

    /// Tastes `image_name` in a new session and returns whether every
    /// selected suite passed.
    ///
    /// Provisioning and readiness failures are logged and reported as
    /// `Ok(false)`. Once an instance exists it is destroyed before this
    /// returns on every path.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ImageNotFound`] (and the flavor and network
    /// equivalents) before anything is created,
    /// [`SessionError::Remote`] when the instance stops accepting SSH
    /// connections, and [`SessionError::Cancelled`] when `cancel` fires.
    pub async fn taste(
        &self,
        image_name: &str,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<bool, SessionError> {
        let started = Utc::now();
        let session_id = SessionId::new(started);
        enter(&session_id, SessionPhase::Resolving);

        let resolved = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SessionError::Cancelled),
            resolved = self.resolve(image_name) => resolved?,
        };

        let name = instance_name(started, &resolved.image.name);
        let session_log =
            SessionLog::create(&self.config.log_dir, session_id.as_str(), self.console.clone())?;
        let log = session_log.instance_log(&name)?;
        log.announce(
            Severity::Info,
            &format!(
                "Tasting {} as '{name}' with username '{}'.\nBuilding...",
                resolved.image.name, settings.ssh_user
            ),
        );

        enter(&session_id, SessionPhase::Provisioning);
        let provisioner = InstanceProvisioner::new(
            self.backend,
            resolved.network.name.clone(),
            self.config.ssh_port,
            self.config.provision,
        );
        let request = ServerRequest {
            name,
            flavor_id: resolved.flavor.id.clone(),
            image_id: resolved.image.id.clone(),
            network_id: resolved.network.id.clone(),
            keypair: self.config.keypair.clone(),
        };
        // Not raced against cancellation: an interrupted create could leave
        // a server nobody destroys.
        let mut instance = match provisioner.create(&request, log.clone()).await {
            Ok(instance) => instance,
            Err(err) => {
                log.announce(Severity::Error, "Failed to create instance.");
                log.error(&err.to_string());
                return Ok(false);
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SessionError::Cancelled),
            outcome = self.exercise(&session_id, &provisioner, &mut instance, &resolved.image, settings) => outcome,
        };

        if matches!(outcome, Err(SessionError::Cancelled)) {
            log.say("\nCaught interrupt");
            log.say(&format!("Exiting session {session_id}"));
            log.warn("Session cancelled; tearing down.");
        }
        log.announce(
            Severity::Info,
            &format!("Destroying instance for session {session_id}.\n"),
        );
        provisioner.destroy(instance).await;
        enter(&session_id, SessionPhase::Destroyed);
        outcome
    }

    async fn resolve(&self, image_name: &str) -> Result<Resolved, SessionError> {
        let image = self
            .backend
            .find_image(image_name)
            .await
            .map_err(|err| SessionError::control_plane("find_image", &err))?
            .ok_or_else(|| SessionError::ImageNotFound {
                name: image_name.to_owned(),
            })?;
        let flavor = self
            .backend
            .find_flavor(&self.config.flavor)
            .await
            .map_err(|err| SessionError::control_plane("find_flavor", &err))?
            .ok_or_else(|| SessionError::FlavorNotFound {
                name: self.config.flavor.clone(),
            })?;
        let network = self
            .backend
            .find_network(&self.config.network)
            .await
            .map_err(|err| SessionError::control_plane("find_network", &err))?
            .ok_or_else(|| SessionError::NetworkNotFound {
                name: self.config.network.clone(),
            })?;
        Ok(Resolved {
            image,
            flavor,
            network,
        })
    }

    async fn exercise(
        &self,
        session_id: &SessionId,
        provisioner: &InstanceProvisioner<'_, B>,
        instance: &mut Instance,
        image: &NamedResource,
        settings: &Settings,
    ) -> Result<bool, SessionError> {
        enter(session_id, SessionPhase::AwaitingReady);
        let address = match provisioner.await_ready(instance).await {
            Ok(address) => address,
            Err(err) => {
                instance.log().announce(Severity::Error, &err.to_string());
                return Ok(false);
            }
        };
        let log = instance.log();
        log.announce(
            Severity::Info,
            &format!("Testing for instance '{}'.", instance.id()),
        );

        enter(session_id, SessionPhase::Testing);
        let target = SshTarget {
            host: address,
            port: self.config.ssh_port,
            user: settings.ssh_user.clone(),
            identity_file: self.config.identity_file.clone(),
        };
        let mut passed = true;
        if settings.security {
            let runner = ComplianceTestRunner::new(
                self.suite,
                self.config.suite_path.clone(),
                self.config.ssh_retry,
                self.config.suite_fallback,
            )
            .with_results_severity(self.config.results_severity.as_str());
            let report = runner
                .run(&ConnectionOptions::from_target(&target), log)
                .await;
            passed &= report.passed();
        }
        if settings.volumes {
            passed &= self.taste_volumes(instance, &target).await?;
        }

        enter(session_id, SessionPhase::Concluding);
        if !passed && settings.create_snapshot {
            log.announce(
                Severity::Info,
                &format!(
                    "Tests failed for instance '{}'. Creating image...",
                    instance.id()
                ),
            );
            self.snapshot(instance, image).await;
        }
        Ok(passed)
    }

    async fn taste_volumes(
        &self,
        instance: &Instance,
        target: &SshTarget,
    ) -> Result<bool, SessionError> {
        let engine = VolumeTestEngine::new(
            self.backend,
            self.connector,
            self.config.volume_timings,
            self.config.mount.clone(),
        );
        match engine.run(instance, target).await {
            Ok(report) => Ok(report.passed()),
            Err(VolumeSuiteError::Inventory(_)) => Ok(false),
            Err(VolumeSuiteError::Connection(err)) => {
                instance
                    .log()
                    .record(Severity::Fatal, Some(SSH_CONTEXT), &err.to_string());
                Err(SessionError::Remote(err))
            }
        }
    }

    /// Captures the instance as an image and waits for it to become active.
    /// Failures are logged only.
    async fn snapshot(&self, instance: &Instance, image: &NamedResource) {
        let log = instance.log();
        let name = snapshot_name(instance.name(), &image.name);
        let image_id = match self.backend.create_snapshot(instance.id(), &name).await {
            Ok(image_id) => image_id,
            Err(err) => {
                log.announce(
                    Severity::Error,
                    &format!("Failed to create snapshot '{name}': {err}"),
                );
                return;
            }
        };

        match self.wait_for_image(&image_id, log).await {
            Ok(()) => log.announce(
                Severity::Info,
                &format!("Snapshot '{name}' ({image_id}) is active."),
            ),
            Err(reason) => log.announce(
                Severity::Error,
                &format!("Snapshot '{name}' ({image_id}) did not become active: {reason}"),
            ),
        }
    }

    async fn wait_for_image(&self, image_id: &str, log: &InstanceLog) -> Result<(), String> {
        let deadline = Deadline::after(self.config.snapshot_timeout);
        loop {
            match self.backend.image_status(image_id).await {
                Ok(Some(status)) if status.eq_ignore_ascii_case(IMAGE_ACTIVE) => return Ok(()),
                Ok(Some(status)) if IMAGE_DEAD.contains(&status.as_str()) => {
                    return Err(format!("image status is {status}"));
                }
                Ok(_) => {}
                Err(err) => log.warn(&format!("Could not read snapshot status: {err}")),
            }
            if deadline.has_passed() {
                return Err(String::from("timed out"));
            }
            sleep(self.config.poll_interval).await;
        }
    }
}

fn enter(session_id: &SessionId, phase: SessionPhase) {
    tracing::info!(session = %session_id, %phase, "session phase");
}

#[cfg(test)]
mod tests;
