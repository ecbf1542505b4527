//! `inspec exec` adapter for [`ComplianceSuite`].

use std::ffi::OsString;
use std::net::IpAddr;

use camino::Utf8Path;
use serde::Deserialize;

use super::{CheckResult, CheckStatus, ComplianceSuite, ConnectionOptions, SuiteError};
use crate::ssh::{CommandRunner, expand_tilde};

/// Exit codes `inspec` uses when the run completed (all passed, some
/// failed, some skipped).
const COMPLETED_EXIT_CODES: [i32; 3] = [0, 100, 101];

#[derive(Debug, Deserialize)]
struct Report {
    #[serde(default)]
    profiles: Vec<Profile>,
}

#[derive(Debug, Deserialize)]
struct Profile {
    #[serde(default)]
    controls: Vec<Control>,
}

#[derive(Debug, Deserialize)]
struct Control {
    id: String,
    #[serde(default)]
    results: Vec<ControlResult>,
}

#[derive(Debug, Deserialize)]
struct ControlResult {
    status: String,
    #[serde(default)]
    code_desc: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    skip_message: Option<String>,
}

/// Runs a profile with the `inspec` command-line tool and parses its JSON
/// reporter output.
#[derive(Clone, Debug)]
pub struct InspecSuite<R: CommandRunner> {
    runner: R,
    inspec_bin: String,
}

impl<R: CommandRunner> InspecSuite<R> {
    /// Creates a suite that invokes `inspec_bin` through `runner`.
    #[must_use]
    pub fn new(runner: R, inspec_bin: impl Into<String>) -> Self {
        Self {
            runner,
            inspec_bin: inspec_bin.into(),
        }
    }

    fn build_args(suite: &Utf8Path, connection: &ConnectionOptions) -> Vec<OsString> {
        let host = match connection.host {
            IpAddr::V4(addr) => addr.to_string(),
            IpAddr::V6(addr) => format!("[{addr}]"),
        };
        let mut args = vec![
            OsString::from("exec"),
            OsString::from(suite.as_str()),
            OsString::from("-t"),
            OsString::from(format!(
                "ssh://{}@{host}:{}",
                connection.user, connection.port
            )),
        ];
        for key in &connection.key_files {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(key.as_str())));
        }
        if connection.sudo {
            args.push(OsString::from("--sudo"));
        }
        args.extend(
            ["--reporter", "json", "--no-color", "--chef-license", "accept-silent"]
                .into_iter()
                .map(OsString::from),
        );
        args
    }
}

impl<R: CommandRunner> ComplianceSuite for InspecSuite<R> {
    fn run(
        &self,
        suite: &Utf8Path,
        connection: &ConnectionOptions,
    ) -> Result<Vec<CheckResult>, SuiteError> {
        let args = Self::build_args(suite, connection);
        let output = self
            .runner
            .run(&self.inspec_bin, &args)
            .map_err(|err| SuiteError::Execution(err.to_string()))?;

        let completed = output
            .code
            .is_some_and(|code| COMPLETED_EXIT_CODES.contains(&code));
        if !completed {
            let detail = output.stderr.trim().to_owned();
            if detail.contains("Connection refused") {
                return Err(SuiteError::ConnectionRefused(detail));
            }
            return Err(SuiteError::Execution(format!(
                "{} exited with {:?}: {detail}",
                self.inspec_bin, output.code
            )));
        }

        parse_report(&output.stdout)
    }
}

/// Flattens an `inspec --reporter json` document into check results.
pub(crate) fn parse_report(json: &str) -> Result<Vec<CheckResult>, SuiteError> {
    let report: Report = serde_json::from_str(json)
        .map_err(|err| SuiteError::Execution(format!("unreadable inspec report: {err}")))?;

    Ok(report
        .profiles
        .into_iter()
        .flat_map(|profile| profile.controls)
        .flat_map(|control| {
            let id = control.id;
            control.results.into_iter().map(move |result| CheckResult {
                id: id.clone(),
                description: result.code_desc,
                status: parse_status(&result.status),
                message: result.message.or(result.skip_message),
            })
        })
        .collect())
}

fn parse_status(status: &str) -> CheckStatus {
    match status {
        "passed" => CheckStatus::Passed,
        "failed" => CheckStatus::Failed,
        "skipped" => CheckStatus::Skipped,
        _ => CheckStatus::Error,
    }
}
