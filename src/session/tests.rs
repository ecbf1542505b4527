//! Unit tests for session orchestration.

use std::time::Duration;

use super::*;
use crate::compliance::{CheckStatus, SuiteError};
use crate::test_support::{
    AttachBehaviour, FakeCloud, ScriptedRunner, ScriptedSuite, ServerBehaviour, SharedBuffer,
    check,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;

const IMAGE: &str = "ubuntu2004";

struct Harness {
    _tmp: TempDir,
    cloud: FakeCloud,
    suite: ScriptedSuite,
    connector: SshConnector<ScriptedRunner>,
    config: SessionConfig,
    console: SharedBuffer,
}

impl Harness {
    fn new(cloud: FakeCloud, runner: ScriptedRunner) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let log_dir =
            Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
        let retry = RetryPolicy::new(1, Duration::ZERO);
        let connector = SshConnector::new(runner, crate::ssh::SshOptions::default(), retry)
            .expect("connector");
        let config = SessionConfig {
            log_dir,
            flavor: String::from("m1.tiny"),
            network: String::from("public"),
            keypair: String::from("ci"),
            identity_file: Utf8PathBuf::from("/keys/taster"),
            ssh_port: 22,
            suite_path: Utf8PathBuf::from("suites/baseline"),
            suite_fallback: SuiteFallback::Pass,
            results_severity: String::from("info"),
            ssh_retry: retry,
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
        };
        Self {
            _tmp: tmp,
            cloud,
            suite: ScriptedSuite::new(),
            connector,
            config,
            console: SharedBuffer::default(),
        }
    }

    async fn taste(
        &self,
        image: &str,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<bool, SessionError> {
        let orchestrator = SessionOrchestrator::new(
            &self.cloud,
            &self.connector,
            &self.suite,
            &self.config,
            Console::from_writer(self.console.clone()),
        );
        orchestrator.taste(image, settings, cancel).await
    }

    fn console(&self) -> String {
        self.console.contents()
    }
}

fn settings(security: bool, volumes: bool, create_snapshot: bool) -> Settings {
    Settings {
        ssh_user: String::from("ubuntu"),
        security,
        volumes,
        create_snapshot,
    }
}

fn five_checks_one_failed() -> Vec<crate::compliance::CheckResult> {
    vec![
        check("a", CheckStatus::Passed),
        check("b", CheckStatus::Passed),
        check("c", CheckStatus::Failed),
        check("d", CheckStatus::Passed),
        check("e", CheckStatus::Passed),
    ]
}

#[fixture]
fn harness() -> Harness {
    Harness::new(
        FakeCloud::new().with_image(IMAGE),
        ScriptedRunner::permissive(),
    )
}

#[rstest]
#[tokio::test]
async fn passing_session_destroys_its_instance_once(harness: Harness) {
    harness
        .suite
        .push_checks(vec![check("a", CheckStatus::Passed)]);

    let passed = harness
        .taste(IMAGE, &settings(true, false, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(passed);
    assert_eq!(harness.cloud.deleted(), vec!["server-1"]);
    assert!(harness.cloud.snapshots().is_empty());
    let created = harness.cloud.created();
    let request = created.first().expect("server requested");
    assert!(request.name.starts_with("taster-"));
    assert!(request.name.ends_with("-ubuntu"));
    assert_eq!(request.image_id, "image-1");
    assert_eq!(request.flavor_id, "flavor-1");
    assert_eq!(request.network_id, "net-1");
    let console = harness.console();
    assert!(console.contains("Tasting ubuntu2004 as 'taster-"));
    assert!(console.contains("with username 'ubuntu'.\nBuilding..."));
    assert!(console.contains("Testing for instance 'server-1'."));
    assert!(console.contains("Destroying instance for session "));
}

#[rstest]
#[tokio::test]
async fn failed_check_snapshots_the_instance(harness: Harness) {
    harness.suite.push_checks(five_checks_one_failed());

    let passed = harness
        .taste(IMAGE, &settings(true, false, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(!passed);
    let snapshots = harness.cloud.snapshots();
    let (server, name) = snapshots.first().expect("snapshot taken");
    assert_eq!(server, "server-1");
    assert!(name.starts_with("taster-"));
    assert!(name.ends_with("-ubuntu_ubuntu2004"));
    assert_eq!(harness.cloud.deleted(), vec!["server-1"]);
    let console = harness.console();
    assert!(console.contains("Tests failed for instance 'server-1'. Creating image..."));
    assert!(console.contains("(snapshot-1) is active."));
}

#[rstest]
#[tokio::test]
async fn snapshot_is_skipped_when_disabled(harness: Harness) {
    harness.suite.push_checks(five_checks_one_failed());

    let passed = harness
        .taste(IMAGE, &settings(true, false, false), &CancellationToken::new())
        .await
        .expect("session");

    assert!(!passed);
    assert!(harness.cloud.snapshots().is_empty());
    assert_eq!(harness.cloud.deleted(), vec!["server-1"]);
}

#[rstest]
#[tokio::test]
async fn snapshot_failure_does_not_change_the_verdict() {
    let harness = Harness::new(
        FakeCloud::new().with_image(IMAGE).failing_snapshot(),
        ScriptedRunner::permissive(),
    );
    harness.suite.push_checks(five_checks_one_failed());

    let passed = harness
        .taste(IMAGE, &settings(true, false, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(!passed);
    assert!(
        harness
            .console()
            .contains("fake control plane: snapshot rejected")
    );
    assert_eq!(harness.cloud.deleted(), vec!["server-1"]);
}

#[rstest]
#[tokio::test]
async fn unreachable_suite_falls_back_to_the_configured_verdict(harness: Harness) {
    harness
        .suite
        .push_error(SuiteError::Execution(String::from("inspec missing")));

    let passed = harness
        .taste(IMAGE, &settings(true, false, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(passed);
    assert!(harness.cloud.snapshots().is_empty());
}

#[rstest]
#[tokio::test]
async fn unknown_image_stops_before_provisioning(harness: Harness) {
    let err = harness
        .taste("fedora", &settings(true, false, true), &CancellationToken::new())
        .await
        .expect_err("unknown image");

    assert!(matches!(err, SessionError::ImageNotFound { ref name } if name == "fedora"));
    assert!(harness.cloud.created().is_empty());
    assert!(harness.cloud.deleted().is_empty());
}

#[rstest]
#[tokio::test]
async fn unknown_flavor_stops_before_provisioning(mut harness: Harness) {
    harness.config.flavor = String::from("m1.huge");

    let err = harness
        .taste(IMAGE, &settings(true, false, true), &CancellationToken::new())
        .await
        .expect_err("unknown flavor");

    assert!(matches!(err, SessionError::FlavorNotFound { .. }));
    assert!(harness.cloud.created().is_empty());
}

#[rstest]
#[tokio::test]
async fn missing_server_fails_without_teardown() {
    let harness = Harness::new(
        FakeCloud::new()
            .with_image(IMAGE)
            .with_servers(ServerBehaviour::ReturnsNothing),
        ScriptedRunner::permissive(),
    );

    let passed = harness
        .taste(IMAGE, &settings(true, false, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(!passed);
    assert!(harness.console().contains("Failed to create instance."));
    assert!(harness.cloud.deleted().is_empty());
    assert!(harness.suite.runs().is_empty());
}

#[rstest]
#[case(ServerBehaviour::NeverReady)]
#[case(ServerBehaviour::Faults(String::from("No valid host was found")))]
#[tokio::test]
async fn unready_instance_fails_and_is_destroyed(#[case] behaviour: ServerBehaviour) {
    let harness = Harness::new(
        FakeCloud::new().with_image(IMAGE).with_servers(behaviour),
        ScriptedRunner::permissive(),
    );

    let passed = harness
        .taste(IMAGE, &settings(true, false, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(!passed);
    assert!(harness.suite.runs().is_empty());
    assert!(harness.cloud.snapshots().is_empty());
    assert_eq!(harness.cloud.deleted(), vec!["server-1"]);
}

#[rstest]
#[tokio::test]
async fn cancellation_tears_down_before_returning() {
    let mut harness = Harness::new(
        FakeCloud::new()
            .with_image(IMAGE)
            .with_servers(ServerBehaviour::NeverReady),
        ScriptedRunner::permissive(),
    );
    harness.config.provision.readiness_timeout = Duration::from_secs(30);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = harness
        .taste(IMAGE, &settings(true, true, true), &cancel)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, SessionError::Cancelled));
    assert_eq!(harness.cloud.deleted(), vec!["server-1"]);
    assert!(harness.cloud.snapshots().is_empty());
    let console = harness.console();
    assert!(console.contains("Caught interrupt"));
    assert!(console.contains("Exiting session "));
}

#[rstest]
#[tokio::test]
async fn cancelled_session_creates_nothing(harness: Harness) {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = harness
        .taste(IMAGE, &settings(true, false, true), &cancel)
        .await
        .expect_err("cancelled");

    assert!(matches!(err, SessionError::Cancelled));
    assert!(harness.cloud.created().is_empty());
}

#[rstest]
#[tokio::test]
async fn volume_suite_runs_after_security_suite() {
    let harness = Harness::new(
        FakeCloud::new()
            .with_image(IMAGE)
            .with_volume("v1", "alpha", AttachBehaviour::Normal),
        ScriptedRunner::permissive(),
    );
    harness
        .suite
        .push_checks(vec![check("a", CheckStatus::Passed)]);

    let passed = harness
        .taste(IMAGE, &settings(true, true, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(passed);
    assert_eq!(harness.cloud.attach_requests(), vec!["v1"]);
    assert_eq!(harness.cloud.detach_requests(), vec!["v1"]);
    assert_eq!(harness.suite.runs().len(), 1);
}

#[rstest]
#[tokio::test]
async fn volume_failure_alone_fails_the_session() {
    let harness = Harness::new(
        FakeCloud::new()
            .with_image(IMAGE)
            .with_volume("v1", "alpha", AttachBehaviour::NeverAppears),
        ScriptedRunner::permissive(),
    );

    let passed = harness
        .taste(IMAGE, &settings(false, true, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(!passed);
    assert!(harness.suite.runs().is_empty());
    assert_eq!(harness.cloud.snapshots().len(), 1);
}

#[rstest]
#[tokio::test]
async fn lost_ssh_connection_ends_the_session_after_teardown() {
    let runner = ScriptedRunner::permissive();
    runner.push_refused();
    runner.push_refused();
    let harness = Harness::new(
        FakeCloud::new()
            .with_image(IMAGE)
            .with_volume("v1", "alpha", AttachBehaviour::Normal),
        runner,
    );

    let err = harness
        .taste(IMAGE, &settings(false, true, true), &CancellationToken::new())
        .await
        .expect_err("connection lost");

    assert!(matches!(
        err,
        SessionError::Remote(RemoteError::RetriesExhausted { .. })
    ));
    assert_eq!(harness.cloud.detach_requests(), vec!["v1"]);
    assert_eq!(harness.cloud.deleted(), vec!["server-1"]);
}

#[rstest]
#[tokio::test]
async fn teardown_failure_keeps_the_verdict() {
    let harness = Harness::new(
        FakeCloud::new().with_image(IMAGE).failing_delete(),
        ScriptedRunner::permissive(),
    );

    let passed = harness
        .taste(IMAGE, &settings(true, false, true), &CancellationToken::new())
        .await
        .expect("session");

    assert!(passed);
    assert_eq!(harness.cloud.deleted(), vec!["server-1"]);
}

#[rstest]
fn phases_render_in_kebab_case() {
    assert_eq!(SessionPhase::AwaitingReady.to_string(), "awaiting-ready");
    assert_eq!(SessionPhase::Destroyed.to_string(), "destroyed");
}
