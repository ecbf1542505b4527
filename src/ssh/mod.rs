//! Remote command execution over the system `ssh` client.
//!
//! [`SshConnector::connect`] probes the instance with a no-op command,
//! retrying while the host refuses connections (the SSH daemon is often the
//! last service to come up on a fresh instance). The returned [`SshSession`]
//! runs further commands against the same target.

use std::ffi::OsString;
use std::future::ready;
use std::net::IpAddr;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::retry::{RetryError, RetryPolicy};
use crate::session_log::{InstanceLog, Severity};

mod runner;
mod util;

pub use runner::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use util::expand_tilde;

/// Exit status `ssh` reports when the connection itself failed.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Log context for entries about the SSH transport.
pub const SSH_CONTEXT: &str = "SSH";

/// Errors raised while talking to an instance over SSH.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when SSH options are missing a required value.
    #[error("invalid ssh option: {field} must not be empty")]
    InvalidOptions {
        /// Option that failed validation.
        field: String,
    },
    /// The host actively refused the connection; usually transient.
    #[error("connection to {host}:{port} refused")]
    ConnectionRefused {
        /// Target address.
        host: IpAddr,
        /// Target port.
        port: u16,
    },
    /// The SSH client failed for any other reason.
    #[error("ssh to {host}:{port} failed: {message}")]
    Connection {
        /// Target address.
        host: IpAddr,
        /// Target port.
        port: u16,
        /// Diagnostic printed by the client.
        message: String,
    },
    /// Every connection attempt was refused.
    #[error("gave up connecting to {host}:{port} after {attempts} attempts")]
    RetriesExhausted {
        /// Target address.
        host: IpAddr,
        /// Target port.
        port: u16,
        /// Number of attempts made.
        attempts: u32,
    },
    /// The client binary could not be started.
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl RemoteError {
    /// Returns `true` for errors worth retrying.
    #[must_use]
    pub const fn is_connection_refused(&self) -> bool {
        matches!(self, Self::ConnectionRefused { .. })
    }
}

/// Client-side SSH settings shared by every session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Whether to force batch mode so the client never prompts.
    pub batch_mode: bool,
    /// Whether to enforce host key checking. Ephemeral hosts have no
    /// known key, so this is normally off.
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    pub known_hosts_file: String,
    /// Seconds the client waits for the TCP connection.
    pub connect_timeout_secs: u64,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            batch_mode: true,
            strict_host_key_checking: false,
            known_hosts_file: String::from("/dev/null"),
            connect_timeout_secs: 10,
        }
    }
}

impl SshOptions {
    /// Checks that required values are present.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidOptions`] when `ssh_bin` is blank.
    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.ssh_bin.trim().is_empty() {
            return Err(RemoteError::InvalidOptions {
                field: String::from("ssh_bin"),
            });
        }
        Ok(())
    }
}

/// Where and as whom to connect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshTarget {
    /// Instance address on the test network.
    pub host: IpAddr,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Private key used for authentication.
    pub identity_file: Utf8PathBuf,
}

/// Output of a remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteOutput {
    /// Exit code of the remote command, if one was reported.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RemoteOutput {
    /// Joins stdout and stderr and drops a single trailing line break, the
    /// form used when comparing command output against expectations.
    #[must_use]
    pub fn chomped(&self) -> String {
        let mut combined = format!("{}{}", self.stdout, self.stderr);
        if combined.ends_with('\n') {
            combined.pop();
            if combined.ends_with('\r') {
                combined.pop();
            }
        }
        combined
    }
}

/// Opens [`SshSession`]s with bounded retry on refused connections.
#[derive(Clone, Debug)]
pub struct SshConnector<R: CommandRunner> {
    runner: R,
    options: SshOptions,
    retry: RetryPolicy,
}

impl<R: CommandRunner> SshConnector<R> {
    /// Creates a connector using `runner` to spawn the client.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidOptions`] when `options` fail
    /// validation.
    pub fn new(runner: R, options: SshOptions, retry: RetryPolicy) -> Result<Self, RemoteError> {
        options.validate()?;
        Ok(Self {
            runner,
            options,
            retry,
        })
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Probes `target` until it accepts a connection and returns a session.
    ///
    /// Refused connections are retried under the connector's policy; each
    /// retry is reported on the instance log and console.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::RetriesExhausted`] when every attempt was
    /// refused, or the first non-transient error otherwise.
    pub async fn connect(
        &self,
        target: &SshTarget,
        log: &InstanceLog,
    ) -> Result<SshSession<'_, R>, RemoteError> {
        let backoff_secs = self.retry.backoff().as_secs();
        let probe = self
            .retry
            .execute(
                |_| ready(self.run(target, "true").map(drop)),
                RemoteError::is_connection_refused,
                |state, err| {
                    let message = format!("Encountered {err} while connecting");
                    log.say(&message);
                    log.record(Severity::Warn, Some(SSH_CONTEXT), &message);
                    log.say(&format!(
                        "Initiating SSH attempt {} in {backoff_secs} seconds",
                        state.attempt + 1
                    ));
                },
            )
            .await;

        match probe {
            Ok(()) => Ok(SshSession {
                connector: self,
                target: target.clone(),
            }),
            Err(RetryError::Exhausted { attempts, last }) => {
                log.record(Severity::Error, Some(SSH_CONTEXT), &last.to_string());
                Err(RemoteError::RetriesExhausted {
                    host: target.host,
                    port: target.port,
                    attempts,
                })
            }
            Err(RetryError::Fatal(err)) => {
                log.record(Severity::Error, Some(SSH_CONTEXT), &err.to_string());
                Err(err)
            }
        }
    }

    fn run(&self, target: &SshTarget, command: &str) -> Result<RemoteOutput, RemoteError> {
        let args = self.build_args(target, command);
        let output = self.runner.run(&self.options.ssh_bin, &args)?;
        classify(target, output)
    }

    fn build_args(&self, target: &SshTarget, remote_command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(target.port.to_string()),
            OsString::from("-i"),
            OsString::from(expand_tilde(target.identity_file.as_str())),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout_secs
            )),
        ];

        if self.options.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.options.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.options.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.options.known_hosts_file
            )));
        }

        args.push(OsString::from(format!("{}@{}", target.user, target.host)));
        args.push(OsString::from(remote_command));
        args
    }
}

fn classify(target: &SshTarget, output: CommandOutput) -> Result<RemoteOutput, RemoteError> {
    if output.code == Some(SSH_CONNECTION_FAILURE) {
        if output.stderr.contains("Connection refused") {
            return Err(RemoteError::ConnectionRefused {
                host: target.host,
                port: target.port,
            });
        }
        return Err(RemoteError::Connection {
            host: target.host,
            port: target.port,
            message: output.stderr.trim().to_owned(),
        });
    }

    Ok(RemoteOutput {
        exit_code: output.code,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// A target that has accepted at least one connection.
#[derive(Debug)]
pub struct SshSession<'c, R: CommandRunner> {
    connector: &'c SshConnector<R>,
    target: SshTarget,
}

impl<R: CommandRunner> SshSession<'_, R> {
    /// Target this session talks to.
    #[must_use]
    pub const fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Runs `command` on the instance.
    ///
    /// A non-zero remote exit status is not an error; callers inspect the
    /// returned output.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError`] when the client cannot reach the host or
    /// cannot be spawned.
    pub fn exec(&self, command: &str) -> Result<RemoteOutput, RemoteError> {
        self.connector.run(&self.target, command)
    }
}
