//! Volume state machine and the in-guest mount verification steps.

use std::fmt;

use shell_escape::unix::escape;
use thiserror::Error;

/// Where a volume is in the attach/mount workflow.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeState {
    /// Not attached to the instance.
    Detached,
    /// Attach requested, not yet confirmed.
    Attaching,
    /// Attached and visible to the guest.
    Attached,
    /// Partition mounted inside the guest.
    Mounted,
    /// Partition unmounted again.
    Unmounted,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Detached => "detached",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Mounted => "mounted",
            Self::Unmounted => "unmounted",
        };
        f.write_str(name)
    }
}

/// Raised when a workflow step would skip or reverse a state.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("volume cannot move from {from} to {to}")]
pub struct IllegalTransition {
    /// Current state.
    pub from: VolumeState,
    /// Requested state.
    pub to: VolumeState,
}

impl VolumeState {
    /// Moves to `next` when the workflow allows it.
    ///
    /// The forward path is `detached → attaching → attached → mounted →
    /// unmounted → detached`. A volume whose workflow stopped early may be
    /// detached from `attaching`, `attached` or `mounted`.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalTransition`] for any other move.
    pub const fn advance(self, next: Self) -> Result<Self, IllegalTransition> {
        match (self, next) {
            (Self::Detached, Self::Attaching)
            | (Self::Attaching, Self::Attached)
            | (Self::Attached, Self::Mounted)
            | (Self::Mounted, Self::Unmounted)
            | (
                Self::Attaching | Self::Attached | Self::Mounted | Self::Unmounted,
                Self::Detached,
            ) => Ok(next),
            (from, to) => Err(IllegalTransition { from, to }),
        }
    }
}

/// What a mount step's output is checked against.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Expectation {
    /// Output is logged but never compared.
    LogOnly,
    /// Output, with one trailing line break removed, must match exactly.
    Exact(String),
}

/// One command run inside the guest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountStep {
    /// Shell command line.
    pub command: String,
    /// Expected output.
    pub expected: Expectation,
    /// State the volume reaches once this step passes, if it changes.
    pub reaches: Option<VolumeState>,
}

impl MountStep {
    fn log_only(command: String) -> Self {
        Self {
            command,
            expected: Expectation::LogOnly,
            reaches: None,
        }
    }

    fn silent(command: String) -> Self {
        Self {
            command,
            expected: Expectation::Exact(String::new()),
            reaches: None,
        }
    }

    const fn reaching(mut self, state: VolumeState) -> Self {
        self.reaches = Some(state);
        self
    }
}

/// Commands run before mounting to record what the guest sees.
pub const DIAGNOSTIC_COMMANDS: [&str; 2] = ["cat /proc/partitions", "dmesg | tail -n 20"];

/// Where and what to verify inside the guest.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountSettings {
    /// Directory the volume is mounted on.
    pub mount_point: String,
    /// Marker file read from the mounted volume.
    pub marker_file: String,
    /// Expected marker contents; `None` logs whatever is read.
    pub marker_contents: Option<String>,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            mount_point: String::from("/mnt/taster_volume"),
            marker_file: String::from("info"),
            marker_contents: None,
        }
    }
}

/// Appends the partition suffix to an attached device path.
#[must_use]
pub fn partition_of(device: &str) -> String {
    format!("{device}1")
}

/// Ordered steps that mount `partition`, read the marker and unmount.
#[must_use]
pub fn mount_plan(partition: &str, settings: &MountSettings) -> Vec<MountStep> {
    let mount = escape(settings.mount_point.as_str().into());
    let marker_path = format!("{}/{}", settings.mount_point, settings.marker_file);
    let marker = escape(marker_path.as_str().into());
    let device = escape(partition.into());

    let read_marker = format!("sudo cat {marker}");
    let marker_step = match &settings.marker_contents {
        Some(contents) => MountStep {
            command: read_marker,
            expected: Expectation::Exact(contents.clone()),
            reaches: None,
        },
        None => MountStep::log_only(read_marker),
    };

    vec![
        // sudo warns about an unresolvable host name on fresh images.
        MountStep::log_only(String::from(
            "echo -e \"127.0.0.1\\t$HOSTNAME\" | sudo tee -a /etc/hosts",
        )),
        MountStep::log_only(String::from("sudo partprobe -s")),
        MountStep::silent(format!("[ -d {mount} ] || sudo mkdir {mount}")),
        MountStep::silent(format!("sudo mount {device} {mount}")).reaching(VolumeState::Mounted),
        marker_step,
        MountStep::silent(format!("sudo umount {mount}")).reaching(VolumeState::Unmounted),
    ]
}
