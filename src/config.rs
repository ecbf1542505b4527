//! Configuration loading via `ortho-config`.
//!
//! Two structures are merged from defaults, `taster.toml` and the
//! environment: [`OpenStackConfig`] reads the conventional `OS_*` variables
//! used by the OpenStack clients, and [`TasterConfig`] carries everything
//! the tasting sessions need under the `TASTER_` prefix.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::compliance::SuiteFallback;
use crate::provision::ProvisionTimings;
use crate::retry::RetryPolicy;
use crate::session::SessionConfig;
use crate::ssh::{SshOptions, expand_tilde};
use crate::volumes::{MountSettings, VolumeTimings};

/// Name of the configuration file mentioned in validation messages.
pub const CONFIG_FILE_NAME: &str = "taster.toml";

/// Longest timeout or interval accepted from configuration (one day).
pub const MAX_DURATION_SECS: u64 = 86_400;

/// OpenStack credentials and endpoint selection.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "OS",
    discovery(
        app_name = "taster",
        env_var = "TASTER_CONFIG_PATH",
        config_file_name = "taster.toml",
        dotfile_name = ".taster.toml",
        project_file_name = "taster.toml"
    )
)]
pub struct OpenStackConfig {
    /// Keystone endpoint, for example `https://keystone.example.com:5000/v3`.
    pub auth_url: String,
    /// User to authenticate as.
    pub username: String,
    /// Password for `username`.
    pub password: String,
    /// Project the token is scoped to.
    pub project_name: String,
    /// Domain of the user.
    #[ortho_config(default = "Default".to_owned())]
    pub user_domain_name: String,
    /// Domain of the project.
    #[ortho_config(default = "Default".to_owned())]
    pub project_domain_name: String,
    /// Region used when the catalog lists several.
    pub region_name: Option<String>,
    /// Endpoint interface picked from the catalog.
    #[ortho_config(default = "public".to_owned())]
    pub interface: String,
}

/// Session settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TASTER",
    discovery(
        app_name = "taster",
        env_var = "TASTER_CONFIG_PATH",
        config_file_name = "taster.toml",
        dotfile_name = ".taster.toml",
        project_file_name = "taster.toml"
    )
)]
pub struct TasterConfig {
    /// Flavor used for every instance.
    #[ortho_config(default = "m1.tiny".to_owned())]
    pub flavor: String,
    /// Network the instance joins and is reached through.
    #[ortho_config(default = "public".to_owned())]
    pub network: String,
    /// Keypair injected into the instance.
    pub keypair: String,
    /// Private key matching `keypair`. Supports `~`.
    pub ssh_private_key: String,
    /// Root directory for session logs.
    #[ortho_config(default = "logs".to_owned())]
    pub log_dir: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// SSH port on the instance.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Whether to force batch mode for SSH.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Seconds the SSH client waits for the TCP connection.
    #[ortho_config(default = 10)]
    pub ssh_connect_timeout_secs: u64,
    /// Path to the `inspec` executable.
    #[ortho_config(default = "inspec".to_owned())]
    pub inspec_bin: String,
    /// Compliance profile location.
    #[ortho_config(default = "tests".to_owned())]
    pub suite_path: String,
    /// Treat a compliance suite that cannot run as passed.
    #[ortho_config(default = true)]
    pub unreachable_suite_passes: bool,
    /// Severity name the compliance results are logged at.
    #[ortho_config(default = "info".to_owned())]
    pub results_severity: String,
    /// Directory volumes are mounted on inside the guest.
    #[ortho_config(default = "/mnt/taster_volume".to_owned())]
    pub mount_point: String,
    /// Marker file read from each mounted volume.
    #[ortho_config(default = "info".to_owned())]
    pub marker_file: String,
    /// Expected marker contents; unset logs whatever is read.
    pub marker_contents: Option<String>,
    /// Seconds to wait for an instance to report active.
    #[ortho_config(default = 20)]
    pub instance_ready_timeout_secs: u64,
    /// Ceiling in seconds on waiting for the guest to accept connections.
    #[ortho_config(default = 30)]
    pub boot_grace_secs: u64,
    /// Seconds to wait for a volume attachment to appear.
    #[ortho_config(default = 10)]
    pub volume_attach_timeout_secs: u64,
    /// Seconds to wait after attaching before the guest is inspected.
    #[ortho_config(default = 20)]
    pub volume_persist_secs: u64,
    /// Retries after a refused SSH or suite connection.
    #[ortho_config(default = 3)]
    pub ssh_max_retries: u32,
    /// Seconds between connection attempts.
    #[ortho_config(default = 15)]
    pub ssh_retry_backoff_secs: u64,
    /// Seconds to wait for a snapshot to become active.
    #[ortho_config(default = 600)]
    pub snapshot_timeout_secs: u64,
    /// Seconds between status polls.
    #[ortho_config(default = 1)]
    pub poll_interval_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE_NAME}",
            metadata.description, metadata.env_var, metadata.toml_key
        )));
    }
    Ok(())
}

fn parse_error(err: &impl std::fmt::Display) -> ConfigError {
    ConfigError::Parse(err.to_string())
}

impl OpenStackConfig {
    /// Loads configuration from defaults, configuration files and
    /// environment variables. Command-line flags belong to the CLI parser
    /// and are not consulted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("taster")]).map_err(|err| parse_error(&err))
    }

    /// Checks that every credential is present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the variable and file key
    /// to set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            (
                self.auth_url.as_str(),
                FieldMetadata::new("Keystone URL", "OS_AUTH_URL", "auth_url"),
            ),
            (
                self.username.as_str(),
                FieldMetadata::new("OpenStack user", "OS_USERNAME", "username"),
            ),
            (
                self.password.as_str(),
                FieldMetadata::new("OpenStack password", "OS_PASSWORD", "password"),
            ),
            (
                self.project_name.as_str(),
                FieldMetadata::new("OpenStack project", "OS_PROJECT_NAME", "project_name"),
            ),
            (
                self.user_domain_name.as_str(),
                FieldMetadata::new("user domain", "OS_USER_DOMAIN_NAME", "user_domain_name"),
            ),
            (
                self.project_domain_name.as_str(),
                FieldMetadata::new(
                    "project domain",
                    "OS_PROJECT_DOMAIN_NAME",
                    "project_domain_name",
                ),
            ),
            (
                self.interface.as_str(),
                FieldMetadata::new("endpoint interface", "OS_INTERFACE", "interface"),
            ),
        ];
        for (value, metadata) in &fields {
            require_field(value, metadata)?;
        }
        Ok(())
    }
}

impl TasterConfig {
    /// Loads configuration from defaults, configuration files and
    /// environment variables. Command-line flags belong to the CLI parser
    /// and are not consulted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("taster")]).map_err(|err| parse_error(&err))
    }

    /// Performs semantic validation. Error messages say how to provide a
    /// missing value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            (
                self.flavor.as_str(),
                FieldMetadata::new("flavor", "TASTER_FLAVOR", "flavor"),
            ),
            (
                self.network.as_str(),
                FieldMetadata::new("network", "TASTER_NETWORK", "network"),
            ),
            (
                self.keypair.as_str(),
                FieldMetadata::new("keypair name", "TASTER_KEYPAIR", "keypair"),
            ),
            (
                self.ssh_private_key.as_str(),
                FieldMetadata::new("SSH private key", "TASTER_SSH_PRIVATE_KEY", "ssh_private_key"),
            ),
            (
                self.log_dir.as_str(),
                FieldMetadata::new("log directory", "TASTER_LOG_DIR", "log_dir"),
            ),
            (
                self.ssh_bin.as_str(),
                FieldMetadata::new("ssh executable", "TASTER_SSH_BIN", "ssh_bin"),
            ),
            (
                self.inspec_bin.as_str(),
                FieldMetadata::new("inspec executable", "TASTER_INSPEC_BIN", "inspec_bin"),
            ),
            (
                self.suite_path.as_str(),
                FieldMetadata::new("compliance suite path", "TASTER_SUITE_PATH", "suite_path"),
            ),
            (
                self.mount_point.as_str(),
                FieldMetadata::new("volume mount point", "TASTER_MOUNT_POINT", "mount_point"),
            ),
            (
                self.marker_file.as_str(),
                FieldMetadata::new("volume marker file", "TASTER_MARKER_FILE", "marker_file"),
            ),
        ];
        for (value, metadata) in &fields {
            require_field(value, metadata)?;
        }

        if self.ssh_port == 0 {
            return Err(ConfigError::Invalid(String::from(
                "ssh_port must be between 1 and 65535",
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(String::from(
                "poll_interval_secs must be at least 1",
            )));
        }
        let durations = [
            ("instance_ready_timeout_secs", self.instance_ready_timeout_secs),
            ("boot_grace_secs", self.boot_grace_secs),
            ("volume_attach_timeout_secs", self.volume_attach_timeout_secs),
            ("volume_persist_secs", self.volume_persist_secs),
            ("ssh_retry_backoff_secs", self.ssh_retry_backoff_secs),
            ("snapshot_timeout_secs", self.snapshot_timeout_secs),
            ("poll_interval_secs", self.poll_interval_secs),
        ];
        for (key, secs) in durations {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{key} must not exceed {MAX_DURATION_SECS} seconds, got {secs}"
                )));
            }
        }
        if !self.mount_point.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "mount_point must be an absolute path, got {}",
                self.mount_point
            )));
        }
        Ok(())
    }

    /// Client options for the system `ssh` binary.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            batch_mode: self.ssh_batch_mode,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
            connect_timeout_secs: self.ssh_connect_timeout_secs,
        }
    }

    /// Retry policy shared by SSH and the compliance suite.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.ssh_max_retries,
            Duration::from_secs(self.ssh_retry_backoff_secs),
        )
    }

    /// Builds the typed settings consumed by the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn as_session_config(&self) -> Result<SessionConfig, ConfigError> {
        self.validate()?;
        let poll_interval = Duration::from_secs(self.poll_interval_secs);
        Ok(SessionConfig {
            log_dir: Utf8PathBuf::from(&self.log_dir),
            flavor: self.flavor.clone(),
            network: self.network.clone(),
            keypair: self.keypair.clone(),
            identity_file: Utf8PathBuf::from(expand_tilde(&self.ssh_private_key)),
            ssh_port: self.ssh_port,
            suite_path: Utf8PathBuf::from(&self.suite_path),
            suite_fallback: SuiteFallback::from_passes(self.unreachable_suite_passes),
            results_severity: self.results_severity.clone(),
            ssh_retry: self.retry_policy(),
            provision: ProvisionTimings {
                readiness_timeout: Duration::from_secs(self.instance_ready_timeout_secs),
                poll_interval,
                boot_grace: Duration::from_secs(self.boot_grace_secs),
                probe_interval: poll_interval,
            },
            volume_timings: VolumeTimings {
                attach_timeout: Duration::from_secs(self.volume_attach_timeout_secs),
                poll_interval,
                persist_wait: Duration::from_secs(self.volume_persist_secs),
            },
            mount: MountSettings {
                mount_point: self.mount_point.clone(),
                marker_file: self.marker_file.clone(),
                marker_contents: self.marker_contents.clone(),
            },
            snapshot_timeout: Duration::from_secs(self.snapshot_timeout_secs),
            poll_interval,
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
