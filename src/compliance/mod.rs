//! Runs the external compliance suite against a provisioned instance.
//!
//! The suite itself is opaque: anything implementing [`ComplianceSuite`] can
//! be plugged in. [`InspecSuite`] shells out to `inspec`. The
//! [`ComplianceTestRunner`] adds retry on refused connections and applies a
//! [`SuiteFallback`] when the suite cannot be run at all.

use std::future::ready;
use std::net::IpAddr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{RetryError, RetryPolicy};
use crate::session_log::{InstanceLog, Severity};
use crate::ssh::SshTarget;

mod inspec;

pub use inspec::InspecSuite;

/// Log context for entries written by the compliance runner.
pub const SUITE_CONTEXT: &str = "Inspec Runner";

/// Severity name the results entry is written at unless configured.
pub const DEFAULT_RESULTS_SEVERITY: &str = "info";

/// Credentials and transport settings handed to the suite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionOptions {
    /// Instance address.
    pub host: IpAddr,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Whether checks run with `sudo`.
    pub sudo: bool,
    /// Private keys offered for authentication.
    pub key_files: Vec<Utf8PathBuf>,
}

impl ConnectionOptions {
    /// Builds suite options for the same host and key the SSH session uses,
    /// with `sudo` enabled.
    #[must_use]
    pub fn from_target(target: &SshTarget) -> Self {
        Self {
            host: target.host,
            port: target.port,
            user: target.user.clone(),
            sudo: true,
            key_files: vec![target.identity_file.clone()],
        }
    }
}

/// Outcome of a single check.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// The check held.
    Passed,
    /// The check did not hold.
    Failed,
    /// The check was not applicable and did not run.
    Skipped,
    /// The check could not be evaluated.
    Error,
}

impl CheckStatus {
    /// Upper-case label used in the results log.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Error => "ERROR",
        }
    }
}

/// One check outcome reported by a suite.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckResult {
    /// Control identifier.
    pub id: String,
    /// Human-readable description of what was checked.
    pub description: String,
    /// Outcome.
    pub status: CheckStatus,
    /// Failure or skip detail, if any.
    pub message: Option<String>,
}

/// Errors raised by a [`ComplianceSuite`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SuiteError {
    /// The suite could not reach the instance; usually transient.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    /// The suite failed for any other reason.
    #[error("suite execution failed: {0}")]
    Execution(String),
}

impl SuiteError {
    /// Returns `true` for errors worth retrying.
    #[must_use]
    pub const fn is_connection_refused(&self) -> bool {
        matches!(self, Self::ConnectionRefused(_))
    }
}

/// Executes a suite of checks against a host.
pub trait ComplianceSuite: Send + Sync {
    /// Runs the suite at `suite` against `connection`, returning every check
    /// in the order the suite reported it.
    ///
    /// # Errors
    ///
    /// Returns [`SuiteError`] when the suite could not be run.
    fn run(
        &self,
        suite: &Utf8Path,
        connection: &ConnectionOptions,
    ) -> Result<Vec<CheckResult>, SuiteError>;
}

/// Verdict applied when the suite cannot be run at all.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SuiteFallback {
    /// Treat an unreachable or broken suite as passed.
    #[default]
    Pass,
    /// Treat an unreachable or broken suite as failed.
    Fail,
}

impl SuiteFallback {
    /// Maps the `unreachable_suite_passes` configuration flag.
    #[must_use]
    pub const fn from_passes(passes: bool) -> Self {
        if passes { Self::Pass } else { Self::Fail }
    }

    const fn passed(self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Result of one compliance run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ComplianceReport {
    /// Checks returned by the suite; empty when the fallback applied.
    pub checks: Vec<CheckResult>,
    /// Why the fallback verdict was used, if it was.
    pub fallback_reason: Option<String>,
    passed: bool,
}

impl ComplianceReport {
    fn from_checks(checks: Vec<CheckResult>) -> Self {
        let passed = !checks
            .iter()
            .any(|check| check.status == CheckStatus::Failed);
        Self {
            checks,
            fallback_reason: None,
            passed,
        }
    }

    const fn from_fallback(reason: String, fallback: SuiteFallback) -> Self {
        Self {
            checks: Vec::new(),
            fallback_reason: Some(reason),
            passed: fallback.passed(),
        }
    }

    /// Suite verdict: `false` iff a check failed, or the fallback says so.
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.passed
    }

    /// Checks with status [`CheckStatus::Failed`].
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|check| check.status == CheckStatus::Failed)
    }
}

/// Drives a [`ComplianceSuite`] with retry and fallback handling.
#[derive(Debug)]
pub struct ComplianceTestRunner<'s, S: ComplianceSuite + ?Sized> {
    suite: &'s S,
    suite_path: Utf8PathBuf,
    retry: RetryPolicy,
    fallback: SuiteFallback,
    results_severity: Option<String>,
}

impl<'s, S: ComplianceSuite + ?Sized> ComplianceTestRunner<'s, S> {
    /// Creates a runner for the suite located at `suite_path`.
    #[must_use]
    pub const fn new(
        suite: &'s S,
        suite_path: Utf8PathBuf,
        retry: RetryPolicy,
        fallback: SuiteFallback,
    ) -> Self {
        Self {
            suite,
            suite_path,
            retry,
            fallback,
            results_severity: None,
        }
    }

    /// Names the severity the results entry is logged at. An unrecognised
    /// name is reported in the log and the results are written at `INFO`.
    #[must_use]
    pub fn with_results_severity(mut self, level: impl Into<String>) -> Self {
        self.results_severity = Some(level.into());
        self
    }

    /// Runs the suite and logs its results.
    ///
    /// Refused connections are retried. Once retries run out, or on any
    /// other suite error, the error is logged and the configured fallback
    /// decides the verdict.
    pub async fn run(&self, connection: &ConnectionOptions, log: &InstanceLog) -> ComplianceReport {
        let backoff_secs = self.retry.backoff().as_secs();
        let outcome = self
            .retry
            .execute(
                |_| ready(self.suite.run(&self.suite_path, connection)),
                SuiteError::is_connection_refused,
                |state, err| {
                    log.say(&format!(
                        "Encountered error \"{err}\" while testing the instance."
                    ));
                    log.say(&format!(
                        "Initiating SSH attempt {} in {backoff_secs} seconds",
                        state.attempt + 1
                    ));
                },
            )
            .await;

        match outcome {
            Ok(checks) => {
                let report = ComplianceReport::from_checks(checks);
                log_results(&report, log, self.results_severity());
                report
            }
            Err(err) => self.fall_back(err, log),
        }
    }

    fn results_severity(&self) -> &str {
        self.results_severity
            .as_deref()
            .unwrap_or(DEFAULT_RESULTS_SEVERITY)
    }

    fn fall_back(&self, err: RetryError<SuiteError>, log: &InstanceLog) -> ComplianceReport {
        let reason = err.to_string();
        log.record(Severity::Error, Some(SUITE_CONTEXT), &reason);
        log.say(&format!(
            "Encountered error \"{}\". Aborting test.",
            err.into_inner()
        ));

        let verdict = if self.fallback.passed() {
            "passed"
        } else {
            "failed"
        };
        log.record(
            Severity::Warn,
            Some(SUITE_CONTEXT),
            &format!("Security suite could not run; treating it as {verdict}."),
        );
        tracing::warn!(fallback = ?self.fallback, %reason, "compliance suite fallback applied");
        ComplianceReport::from_fallback(reason, self.fallback)
    }
}

fn log_results(report: &ComplianceReport, log: &InstanceLog, level: &str) {
    let lines: Vec<String> = report
        .checks
        .iter()
        .map(|check| {
            format!(
                "{}: {}\n{}",
                check.status.label(),
                check.description,
                check.message.as_deref().unwrap_or_default()
            )
        })
        .collect();
    log.record_named(
        level,
        Some(SUITE_CONTEXT),
        &format!("Inspec Test Results\n{}", lines.join("\n")),
        false,
    );

    if !report.passed() {
        log.announce(Severity::Warn, "Image failed security test suite");
    }
}
