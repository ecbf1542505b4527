//! Behavioural coverage for whole tasting sessions against an in-memory
//! cloud: verdicts, snapshots on failure and guaranteed teardown.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use taster::RetryPolicy;
use taster::compliance::{CheckStatus, SuiteFallback};
use taster::provision::ProvisionTimings;
use taster::session::{SessionConfig, SessionError, SessionOrchestrator, Settings};
use taster::session_log::Console;
use taster::ssh::{SshConnector, SshOptions};
use taster::test_support::{
    AttachBehaviour, FakeCloud, ScriptedRunner, ScriptedSuite, SharedBuffer, check,
};
use taster::volumes::{MountSettings, VolumeTimings};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
struct TasteWorld {
    cloud: FakeCloud,
    suite: ScriptedSuite,
    runner: ScriptedRunner,
    console: SharedBuffer,
    log_root: Utf8PathBuf,
    _tmp: Arc<TempDir>,
}

impl TasteWorld {
    fn new(cloud: FakeCloud) -> Self {
        let tmp = Arc::new(TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}")));
        let log_root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("log root should be utf8: {}", path.display()));
        Self {
            cloud,
            suite: ScriptedSuite::new(),
            runner: ScriptedRunner::permissive(),
            console: SharedBuffer::default(),
            log_root,
            _tmp: tmp,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            log_dir: self.log_root.clone(),
            flavor: String::from("m1.tiny"),
            network: String::from("public"),
            keypair: String::from("ci"),
            identity_file: Utf8PathBuf::from("/keys/taster"),
            ssh_port: 22,
            suite_path: Utf8PathBuf::from("suites/baseline"),
            suite_fallback: SuiteFallback::Pass,
            results_severity: String::from("info"),
            ssh_retry: retry(),
            provision: ProvisionTimings {
                readiness_timeout: Duration::from_millis(50),
                poll_interval: Duration::from_millis(1),
                boot_grace: Duration::ZERO,
                probe_interval: Duration::from_millis(1),
            },
            volume_timings: VolumeTimings {
                attach_timeout: Duration::from_millis(20),
                poll_interval: Duration::from_millis(1),
                persist_wait: Duration::ZERO,
            },
            mount: MountSettings::default(),
            snapshot_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn taste(&self, image: &str, settings: &Settings) -> TasteOutcome {
        let config = self.session_config();
        let connector = SshConnector::new(self.runner.clone(), SshOptions::default(), retry())
            .unwrap_or_else(|err| panic!("connector: {err}"));
        let orchestrator = SessionOrchestrator::new(
            &self.cloud,
            &connector,
            &self.suite,
            &config,
            Console::from_writer(self.console.clone()),
        );
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap_or_else(|err| panic!("runtime: {err}"));
        let verdict =
            runtime.block_on(orchestrator.taste(image, settings, &CancellationToken::new()));
        TasteOutcome { verdict }
    }
}

#[derive(Debug)]
struct TasteOutcome {
    verdict: Result<bool, SessionError>,
}

const fn retry() -> RetryPolicy {
    RetryPolicy::new(1, Duration::ZERO)
}

fn settings(security: bool, volumes: bool) -> Settings {
    Settings {
        ssh_user: String::from("ubuntu"),
        security,
        volumes,
        create_snapshot: true,
    }
}

#[fixture]
fn world() -> TasteWorld {
    TasteWorld::new(FakeCloud::new())
}

#[fixture]
fn outcome() -> TasteOutcome {
    TasteOutcome {
        verdict: Ok(false),
    }
}

#[given("a cloud offering image \"{image}\"")]
fn cloud_offering_image(image: String) -> TasteWorld {
    TasteWorld::new(FakeCloud::new().with_image(&image))
}

#[given("a compliance suite where every check passes")]
fn passing_suite(world: &TasteWorld) {
    world.suite.push_checks(vec![
        check("ssh-root-login", CheckStatus::Passed),
        check("firewall-enabled", CheckStatus::Passed),
        check("tmp-noexec", CheckStatus::Skipped),
    ]);
}

#[given("a compliance suite with one failing check")]
fn failing_suite(world: &TasteWorld) {
    world.suite.push_checks(vec![
        check("ssh-root-login", CheckStatus::Passed),
        check("firewall-enabled", CheckStatus::Failed),
    ]);
}

#[given("a volume that never attaches")]
fn unattachable_volume(world: &TasteWorld) -> TasteWorld {
    TasteWorld {
        cloud: world
            .cloud
            .clone()
            .with_volume("v1", "scratch", AttachBehaviour::NeverAppears),
        ..world.clone()
    }
}

#[when("I taste \"{image}\" with snapshots enabled")]
fn taste_with_snapshots(world: &TasteWorld, image: String) -> TasteOutcome {
    world.taste(&image, &settings(true, false))
}

#[when("I taste \"{image}\" with only the volume suite")]
fn taste_volumes_only(world: &TasteWorld, image: String) -> TasteOutcome {
    world.taste(&image, &settings(false, true))
}

#[then("the session passes")]
fn session_passes(outcome: &TasteOutcome) {
    assert!(
        matches!(outcome.verdict, Ok(true)),
        "expected a pass, got {:?}",
        outcome.verdict
    );
}

#[then("the session fails")]
fn session_fails(outcome: &TasteOutcome) {
    assert!(
        matches!(outcome.verdict, Ok(false)),
        "expected a failure, got {:?}",
        outcome.verdict
    );
}

#[then("the session reports an unknown image")]
fn session_reports_unknown_image(outcome: &TasteOutcome) {
    let Err(SessionError::ImageNotFound { ref name }) = outcome.verdict else {
        panic!("expected ImageNotFound, got {:?}", outcome.verdict);
    };
    assert_eq!(name, "fedora39");
}

#[then("the instance is destroyed once")]
fn instance_destroyed_once(world: &TasteWorld) {
    assert_eq!(world.cloud.deleted(), vec![String::from("server-1")]);
    assert!(
        world.console.contents().contains("Destroying instance for session"),
        "teardown should be announced"
    );
}

#[then("no snapshot is taken")]
fn no_snapshot(world: &TasteWorld) {
    assert!(world.cloud.snapshots().is_empty());
}

#[then("a snapshot of the instance is taken")]
fn snapshot_taken(world: &TasteWorld) {
    let snapshots = world.cloud.snapshots();
    let (server_id, name) = snapshots
        .first()
        .unwrap_or_else(|| panic!("expected a snapshot"));
    assert_eq!(server_id, "server-1");
    assert!(name.ends_with("-ubuntu_ubuntu2004"), "unexpected name {name}");
}

#[then("no instance is created")]
fn no_instance(world: &TasteWorld) {
    assert!(world.cloud.created().is_empty());
    assert!(world.cloud.deleted().is_empty());
}

#[then("an attachment was requested for the volume")]
fn attachment_requested(world: &TasteWorld) {
    assert_eq!(world.cloud.attach_requests(), vec![String::from("v1")]);
}

#[scenario(
    path = "tests/features/taste.feature",
    name = "A passing image is destroyed without a snapshot"
)]
fn scenario_passing_image(world: TasteWorld, outcome: TasteOutcome) {
    let _ = (world, outcome);
}

#[scenario(
    path = "tests/features/taste.feature",
    name = "A failing image is snapshotted before teardown"
)]
fn scenario_failing_image(world: TasteWorld, outcome: TasteOutcome) {
    let _ = (world, outcome);
}

#[scenario(
    path = "tests/features/taste.feature",
    name = "An unknown image creates nothing"
)]
fn scenario_unknown_image(world: TasteWorld, outcome: TasteOutcome) {
    let _ = (world, outcome);
}

#[scenario(
    path = "tests/features/taste.feature",
    name = "A volume that never attaches fails the session"
)]
fn scenario_unattachable_volume(world: TasteWorld, outcome: TasteOutcome) {
    let _ = (world, outcome);
}
