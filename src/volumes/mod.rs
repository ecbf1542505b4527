//! Attach, mount, verify, unmount and detach every volume on the account.
//!
//! Each volume is processed independently: a failure on one never stops the
//! next. A second pass detaches every volume, including those skipped
//! because they were already attached elsewhere.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::backend::{VolumeBackend, VolumeInfo};
use crate::provision::Instance;
use crate::retry::Deadline;
use crate::session_log::{InstanceLog, Severity};
use crate::ssh::{CommandRunner, RemoteError, SshConnector, SshSession, SshTarget};

mod plan;

pub use plan::{
    DIAGNOSTIC_COMMANDS, Expectation, IllegalTransition, MountSettings, MountStep, VolumeState,
    mount_plan, partition_of,
};

/// Why a volume could not be attached.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AttachError {
    /// The attachment never showed up before the deadline.
    #[error("Operation timed out.")]
    Timeout,
    /// The attachment disappeared during the persistence wait.
    #[error("Volume was unexpectedly detached.")]
    UnexpectedDetach,
    /// The server lists the attachment but the volume record does not.
    #[error("Volume host might be down.")]
    HostDown,
    /// The control plane rejected a request.
    #[error("{0}")]
    Provider(String),
}

/// Result of the in-guest mount verification for one volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MountOutcome {
    /// Every step produced the expected output.
    Verified,
    /// A step's output did not match; later steps were skipped.
    Mismatch {
        /// Command whose output differed.
        command: String,
        /// Expected output.
        expected: String,
        /// Actual output.
        actual: String,
    },
    /// A step could not be run; later steps were skipped.
    CommandFailed {
        /// Command that could not be run.
        command: String,
        /// Transport error.
        message: String,
    },
}

impl MountOutcome {
    /// Returns `true` when every step passed.
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// A volume that failed a phase of the workflow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeFailure {
    /// Volume identifier.
    pub volume_id: String,
    /// Volume name.
    pub volume_name: String,
    /// What went wrong.
    pub reason: String,
}

impl VolumeFailure {
    fn new(volume: &VolumeInfo, reason: impl Into<String>) -> Self {
        Self {
            volume_id: volume.id.clone(),
            volume_name: volume.name.clone(),
            reason: reason.into(),
        }
    }
}

/// Aggregate result of the volume suite.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VolumeReport {
    /// Volumes that were already attached and therefore not exercised.
    pub skipped: Vec<String>,
    /// Volumes whose mount verification passed.
    pub verified: Vec<String>,
    /// Volumes that failed to attach or verify.
    pub mount_failures: Vec<VolumeFailure>,
    /// Volumes that failed to detach.
    pub detach_failures: Vec<VolumeFailure>,
}

impl VolumeReport {
    /// Suite verdict: no mount failures and no detach failures.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.mount_failures.is_empty() && self.detach_failures.is_empty()
    }
}

/// Errors that abort the whole volume suite.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VolumeSuiteError {
    /// The volume inventory could not be listed.
    #[error("failed to list volumes: {0}")]
    Inventory(String),
    /// The instance stopped accepting SSH connections.
    #[error(transparent)]
    Connection(#[from] RemoteError),
}

/// Waits applied while attaching volumes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VolumeTimings {
    /// Deadline for an attachment to appear on the server.
    pub attach_timeout: Duration,
    /// Pause between attachment polls.
    pub poll_interval: Duration,
    /// Wait before re-checking that the attachment held.
    pub persist_wait: Duration,
}

impl Default for VolumeTimings {
    fn default() -> Self {
        Self {
            attach_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            persist_wait: Duration::from_secs(20),
        }
    }
}

/// Drives the volume workflow for one instance.
#[derive(Debug)]
pub struct VolumeTestEngine<'a, B: VolumeBackend, R: CommandRunner> {
    backend: &'a B,
    connector: &'a SshConnector<R>,
    timings: VolumeTimings,
    mount: MountSettings,
}

impl<'a, B: VolumeBackend, R: CommandRunner> VolumeTestEngine<'a, B, R> {
    /// Creates an engine.
    #[must_use]
    pub const fn new(
        backend: &'a B,
        connector: &'a SshConnector<R>,
        timings: VolumeTimings,
        mount: MountSettings,
    ) -> Self {
        Self {
            backend,
            connector,
            timings,
            mount,
        }
    }

    /// Runs the workflow over every volume and logs the tally.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeSuiteError::Inventory`] when volumes cannot be listed
    /// and [`VolumeSuiteError::Connection`] when SSH retries run out. The
    /// detach pass still runs before a connection error is returned.
    pub async fn run(
        &self,
        instance: &Instance,
        target: &SshTarget,
    ) -> Result<VolumeReport, VolumeSuiteError> {
        let log = instance.log();
        let volumes = self.backend.list_volumes().await.map_err(|err| {
            let message = err.to_string();
            log.error(&format!("Failed to list volumes: {message}"));
            VolumeSuiteError::Inventory(message)
        })?;

        let mut report = VolumeReport::default();
        let mut states = BTreeMap::new();
        let mut fatal = None;
        for volume in &volumes {
            if volume.is_attached() {
                log.announce(
                    Severity::Info,
                    &format!(
                        "Volume '{}' is already in an attached state; skipping.",
                        volume.name
                    ),
                );
                report.skipped.push(volume.name.clone());
                continue;
            }

            let state = states
                .entry(volume.id.clone())
                .or_insert(VolumeState::Detached);
            match self.exercise(instance, target, volume, state).await {
                Ok(Ok(())) => report.verified.push(volume.name.clone()),
                Ok(Err(failure)) => report.mount_failures.push(failure),
                Err(err) => {
                    report
                        .mount_failures
                        .push(VolumeFailure::new(volume, err.to_string()));
                    fatal = Some(err);
                    break;
                }
            }
        }

        for volume in &volumes {
            match self.detach(instance, volume).await {
                Ok(()) => {
                    if let Some(state) = states.get_mut(&volume.id) {
                        step(state, VolumeState::Detached, volume, log);
                    }
                }
                Err(failure) => report.detach_failures.push(failure),
            }
        }

        if let Some(err) = fatal {
            return Err(VolumeSuiteError::Connection(err));
        }
        log_tally(&report, log);
        Ok(report)
    }

    /// Attaches and verifies one volume. The outer error is fatal for the
    /// suite; the inner one is a per-volume failure.
    async fn exercise(
        &self,
        instance: &Instance,
        target: &SshTarget,
        volume: &VolumeInfo,
        state: &mut VolumeState,
    ) -> Result<Result<(), VolumeFailure>, RemoteError> {
        let log = instance.log();
        step(state, VolumeState::Attaching, volume, log);

        let device = match self.attach(instance, volume).await {
            Ok(device) => device,
            Err(err) => {
                log.announce(
                    Severity::Error,
                    &format!("Failed to attach '{}': {err}", volume.name),
                );
                log.announce(
                    Severity::Error,
                    &format!("Volume '{}' failed to attach.", volume.name),
                );
                return Ok(Err(VolumeFailure::new(volume, err.to_string())));
            }
        };
        step(state, VolumeState::Attached, volume, log);

        let session = self.connector.connect(target, log).await?;
        log_partitions(&session, log);

        log.announce(
            Severity::Info,
            &format!("Mounting volume '{}' ({})...", volume.name, volume.id),
        );
        log.announce(Severity::Info, "Mounting from inside the instance...");
        let outcome = self.verify_mount(&session, &partition_of(&device), state, volume, log);

        Ok(match outcome {
            MountOutcome::Verified => Ok(()),
            MountOutcome::Mismatch {
                command,
                expected,
                actual,
            } => {
                log.announce(
                    Severity::Error,
                    &format!(
                        "Failure while running '{command}':\n\texpected '{expected}'\n\tgot '{actual}'"
                    ),
                );
                Err(VolumeFailure::new(
                    volume,
                    format!("'{command}' returned unexpected output"),
                ))
            }
            MountOutcome::CommandFailed { command, message } => {
                log.announce(
                    Severity::Error,
                    &format!("Failure while running '{command}': {message}"),
                );
                Err(VolumeFailure::new(volume, message))
            }
        })
    }

    async fn attach(&self, instance: &Instance, volume: &VolumeInfo) -> Result<String, AttachError> {
        let log = instance.log();
        let provider = |err: B::Error| {
            let message = err.to_string();
            log.error(&message);
            AttachError::Provider(message)
        };

        log.announce(
            Severity::Info,
            &format!("Attaching volume '{}' ({})...", volume.name, volume.id),
        );
        self.backend
            .attach_volume(instance.id(), &volume.id)
            .await
            .map_err(provider)?;

        let deadline = Deadline::after(self.timings.attach_timeout);
        loop {
            let listed = self
                .backend
                .list_attachments(instance.id())
                .await
                .map_err(provider)?;
            if listed.contains(&volume.id) {
                break;
            }
            if deadline.has_passed() {
                return Err(AttachError::Timeout);
            }
            sleep(self.timings.poll_interval).await;
        }

        log.announce(
            Severity::Info,
            &format!(
                "Sleeping {} seconds for attachment persistence...",
                self.timings.persist_wait.as_secs()
            ),
        );
        sleep(self.timings.persist_wait).await;

        let still_listed = self
            .backend
            .list_attachments(instance.id())
            .await
            .map_err(provider)?
            .contains(&volume.id);
        if !still_listed {
            return Err(AttachError::UnexpectedDetach);
        }

        self.backend
            .fetch_volume(&volume.id)
            .await
            .map_err(provider)?
            .and_then(|current| {
                current
                    .attachment_to(instance.id())
                    .and_then(|attachment| attachment.device.clone())
            })
            .ok_or(AttachError::HostDown)
    }

    fn verify_mount(
        &self,
        session: &SshSession<'_, R>,
        partition: &str,
        state: &mut VolumeState,
        volume: &VolumeInfo,
        log: &InstanceLog,
    ) -> MountOutcome {
        for mount_step in mount_plan(partition, &self.mount) {
            let actual = match session.exec(&mount_step.command) {
                Ok(output) => output.chomped(),
                Err(err) => {
                    return MountOutcome::CommandFailed {
                        command: mount_step.command,
                        message: err.to_string(),
                    };
                }
            };

            match mount_step.expected {
                Expectation::LogOnly => {
                    log.info(&format!("{} yielded '{actual}'", mount_step.command));
                }
                Expectation::Exact(expected) if expected != actual => {
                    return MountOutcome::Mismatch {
                        command: mount_step.command,
                        expected,
                        actual,
                    };
                }
                Expectation::Exact(_) => {}
            }

            if let Some(next) = mount_step.reaches {
                step(state, next, volume, log);
            }
        }
        MountOutcome::Verified
    }

    async fn detach(&self, instance: &Instance, volume: &VolumeInfo) -> Result<(), VolumeFailure> {
        let log = instance.log();
        log.announce(Severity::Info, &format!("Detaching {}.", volume.name));
        self.backend
            .detach_volume(instance.id(), &volume.id)
            .await
            .map_err(|err| {
                log.say("Failed to detach. check log for details.");
                log.error(&err.to_string());
                VolumeFailure::new(volume, err.to_string())
            })
    }
}

fn log_partitions<R: CommandRunner>(session: &SshSession<'_, R>, log: &InstanceLog) {
    log.say("Logging partition list and dmesg...");
    for command in DIAGNOSTIC_COMMANDS {
        match session.exec(command) {
            Ok(output) => log.info(&format!(
                "Ran '{command}' and got '{}'",
                output.chomped()
            )),
            Err(err) => log.warn(&format!("Could not run '{command}': {err}")),
        }
    }
}

fn step(state: &mut VolumeState, next: VolumeState, volume: &VolumeInfo, log: &InstanceLog) {
    match state.advance(next) {
        Ok(reached) => {
            tracing::debug!(volume = %volume.id, from = %state, to = %reached, "volume state");
            *state = reached;
        }
        Err(err) => log.warn(&format!("Volume '{}': {err}", volume.name)),
    }
}

fn log_tally(report: &VolumeReport, log: &InstanceLog) {
    if report.passed() {
        log.announce(Severity::Info, "Encountered 0 failures.");
        return;
    }
    log.announce(
        Severity::Error,
        &format!(
            "Encountered {} mount failures and {} detach failures.",
            report.mount_failures.len(),
            report.detach_failures.len()
        ),
    );
    log.announce(Severity::Error, "Encountered failures.");
}
