//! Binary entry point for the taster CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use taster::{
    Console, InspecSuite, OpenStackBackend, OpenStackConfig, ProcessCommandRunner, SessionError,
    SessionOrchestrator, Settings, SshConnector, TasterConfig,
};

mod cli;

use cli::{Cli, TasteCommand};

/// Environment variable holding the tracing filter directives.
const LOG_FILTER_ENV: &str = "TASTER_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

const EXIT_PASSED: i32 = 0;
const EXIT_FAILED: i32 = 1;
/// Conventional status for a process stopped by SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("ssh error: {0}")]
    Ssh(String),
}

/// Verdicts collected across the images of one invocation.
#[derive(Debug, Default)]
struct Tally {
    passed: Vec<String>,
    failed: Vec<String>,
    skipped: Vec<String>,
    interrupted: bool,
    stopped: bool,
}

impl Tally {
    fn record(&mut self, image: &str, outcome: Result<bool, SessionError>) {
        match outcome {
            Ok(true) => self.passed.push(image.to_owned()),
            Ok(false) => self.failed.push(image.to_owned()),
            Err(SessionError::Cancelled) => self.interrupted = true,
            Err(err @ SessionError::ImageNotFound { .. }) => {
                writeln!(io::stderr(), "{image}: {err}").ok();
                self.failed.push(image.to_owned());
                self.stopped = true;
            }
            Err(err) => {
                writeln!(io::stderr(), "{image}: {err}").ok();
                self.failed.push(image.to_owned());
            }
        }
    }

    /// Returns `true` once no further image should be tasted.
    const fn should_stop(&self) -> bool {
        self.interrupted || self.stopped
    }

    const fn exit_code(&self) -> i32 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.failed.is_empty() {
            EXIT_PASSED
        } else {
            EXIT_FAILED
        }
    }

    fn write_summary(&self, mut target: impl Write) {
        if self.interrupted {
            writeln!(target, "Interrupted.").ok();
        }
        writeln!(
            target,
            "Tasted {} image(s): {} passed, {} failed.",
            self.passed.len() + self.failed.len(),
            self.passed.len(),
            self.failed.len()
        )
        .ok();
        for image in &self.failed {
            writeln!(target, "  failed: {image}").ok();
        }
        for image in &self.skipped {
            writeln!(target, "  skipped: {image}").ok();
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            EXIT_FAILED
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Taste(command) => taste_images(command).await,
    }
}

async fn taste_images(args: TasteCommand) -> Result<i32, CliError> {
    let settings = settings_for(&args);
    let openstack_config =
        OpenStackConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let mut taster_config =
        TasterConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    if let Some(log_dir) = args.log_dir {
        taster_config.log_dir = log_dir;
    }
    let session_config = taster_config
        .as_session_config()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let backend = OpenStackBackend::new(openstack_config)
        .map_err(|err| CliError::Backend(err.to_string()))?;
    let connector = SshConnector::new(
        ProcessCommandRunner,
        taster_config.ssh_options(),
        session_config.ssh_retry,
    )
    .map_err(|err| CliError::Ssh(err.to_string()))?;
    let suite = InspecSuite::new(ProcessCommandRunner, taster_config.inspec_bin.clone());
    let orchestrator = SessionOrchestrator::new(
        &backend,
        &connector,
        &suite,
        &session_config,
        Console::stdout(),
    );

    let cancel = CancellationToken::new();
    spawn_interrupt_listener(cancel.clone());

    let mut tally = Tally::default();
    let mut images = args.images.into_iter();
    for image in images.by_ref() {
        let outcome = orchestrator.taste(&image, &settings, &cancel).await;
        tally.record(&image, outcome);
        if tally.should_stop() {
            break;
        }
    }
    tally.skipped.extend(images);

    tally.write_summary(io::stdout());
    Ok(tally.exit_code())
}

fn settings_for(args: &TasteCommand) -> Settings {
    Settings {
        ssh_user: args.ssh_user.clone(),
        security: !args.skip_security,
        volumes: !args.skip_volumes,
        create_snapshot: args.create_snapshot,
    }
}

fn spawn_interrupt_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if await_interrupts(tokio::signal::ctrl_c, &cancel).await {
            process::exit(EXIT_INTERRUPTED);
        }
    });
}

/// Cancels `cancel` on the first interrupt and returns `true` if a second
/// one arrives while the session is still unwinding.
async fn await_interrupts<S, F>(mut interrupt: S, cancel: &CancellationToken) -> bool
where
    S: FnMut() -> F,
    F: Future<Output = io::Result<()>>,
{
    if interrupt().await.is_err() {
        return false;
    }
    tracing::warn!("interrupt received, cancelling the running session");
    writeln!(
        io::stderr(),
        "Interrupted; tearing down. Press Ctrl-C again to exit immediately."
    )
    .ok();
    cancel.cancel();

    if interrupt().await.is_err() {
        return false;
    }
    tracing::warn!("second interrupt received, exiting without teardown");
    true
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
