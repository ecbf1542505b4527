//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::future::ready;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::backend::{
    Backend, BackendFuture, NamedResource, STATUS_ACTIVE, STATUS_ERROR, ServerHandle,
    ServerRequest, ServerSnapshot, VolumeAttachment, VolumeBackend, VolumeInfo,
};
use crate::compliance::{CheckResult, CheckStatus, ComplianceSuite, ConnectionOptions, SuiteError};
use crate::ssh::{CommandError, CommandOutput, CommandRunner};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Address the fake control plane hands out to every server.
pub const FAKE_SERVER_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Last argument, which for `ssh` is the remote command.
    #[must_use]
    pub fn remote_command(&self) -> Option<String> {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Default)]
struct RunnerScript {
    queued: VecDeque<CommandOutput>,
    rules: Vec<(String, CommandOutput)>,
    fallback: Option<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

/// Scripted command runner.
///
/// Queued outputs are returned first in FIFO order. Once the queue is empty,
/// the first rule whose fragment appears in the command line answers, then
/// the fallback output if one was set. Anything else fails to spawn.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<RunnerScript>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that answers unmatched commands with an empty
    /// success.
    #[must_use]
    pub fn permissive() -> Self {
        let runner = Self::new();
        lock(&runner.script).fallback = Some(success(""));
        runner
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.script).invocations.clone()
    }

    /// Remote commands seen so far, in order.
    #[must_use]
    pub fn remote_commands(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .filter_map(CommandInvocation::remote_command)
            .collect()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes an `ssh` connection refusal.
    pub fn push_refused(&self) {
        lock(&self.script).queued.push_back(refused());
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.script).queued.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }

    /// Answers every command containing `fragment` with `output`.
    pub fn on_command(&self, fragment: impl Into<String>, output: CommandOutput) {
        lock(&self.script).rules.push((fragment.into(), output));
    }

    /// Answers every command containing `fragment` with a successful exit
    /// and `stdout`.
    pub fn respond(&self, fragment: impl Into<String>, stdout: impl Into<String>) {
        self.on_command(fragment, success(stdout));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        let command = invocation.command_string();
        let mut script = lock(&self.script);
        script.invocations.push(invocation);

        if let Some(output) = script.queued.pop_front() {
            return Ok(output);
        }
        let matched = script
            .rules
            .iter()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, output)| output.clone());
        matched
            .or_else(|| script.fallback.clone())
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Successful output carrying `stdout`.
#[must_use]
pub fn success(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

/// Output `ssh` produces when the host refuses the connection.
#[must_use]
pub fn refused() -> CommandOutput {
    CommandOutput {
        code: Some(255),
        stdout: String::new(),
        stderr: format!("ssh: connect to host {FAKE_SERVER_ADDRESS} port 22: Connection refused\n"),
    }
}

/// In-memory writer whose contents can be inspected after the fact.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Returns everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.bytes).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Error returned by [`FakeCloud`] when a scripted failure fires.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("fake control plane: {0}")]
pub struct FakeCloudError(pub String);

/// How servers created by [`FakeCloud`] behave.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ServerBehaviour {
    /// Becomes active after the given number of status polls.
    #[default]
    Boots,
    /// Reports `BUILD` for the given number of polls, then becomes active.
    BootsAfter(u32),
    /// Never leaves `BUILD`.
    NeverReady,
    /// Goes to `ERROR` with the given fault message.
    Faults(String),
    /// The create call succeeds but returns no server.
    ReturnsNothing,
}

/// How a volume responds to attach requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AttachBehaviour {
    /// Attaches normally.
    #[default]
    Normal,
    /// The attachment never shows up on the server.
    NeverAppears,
    /// The attachment is listed once, then disappears.
    DropsAfterFirstCheck,
    /// The server lists the attachment but the volume record does not.
    HostDown,
    /// The attach request itself fails.
    Rejected,
}

#[derive(Clone, Debug)]
struct FakeVolume {
    id: String,
    name: String,
    behaviour: AttachBehaviour,
    /// Attachment as recorded on the volume.
    attachments: Vec<VolumeAttachment>,
    /// Server the compute service lists this volume under.
    listed_on: Option<String>,
    detach_fails: bool,
}

#[derive(Clone, Debug)]
struct FakeServer {
    polls: u32,
}

#[derive(Debug, Default)]
struct CloudState {
    images: BTreeMap<String, String>,
    flavors: BTreeMap<String, String>,
    networks: BTreeMap<String, String>,
    server_behaviour: ServerBehaviour,
    servers: BTreeMap<String, FakeServer>,
    created: Vec<ServerRequest>,
    deleted: Vec<String>,
    delete_fails: bool,
    volumes: Vec<FakeVolume>,
    list_volumes_fails: bool,
    attach_requests: Vec<String>,
    detach_requests: Vec<String>,
    snapshots: Vec<(String, String)>,
    snapshot_fails: bool,
    next_device: u8,
}

/// In-memory control plane.
///
/// Ships with flavor `m1.tiny` and network `public`; images and volumes are
/// added with the `with_*` builders. Every server gets
/// [`FAKE_SERVER_ADDRESS`] on `public`.
#[derive(Clone, Debug)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        let mut state = CloudState::default();
        state
            .flavors
            .insert(String::from("m1.tiny"), String::from("flavor-1"));
        state
            .networks
            .insert(String::from("public"), String::from("net-1"));
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

impl FakeCloud {
    /// Creates a control plane with the default flavor and network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        lock(&self.state)
    }

    /// Registers an image.
    #[must_use]
    pub fn with_image(self, name: &str) -> Self {
        {
            let mut state = self.state();
            let id = format!("image-{}", state.images.len() + 1);
            state.images.insert(name.to_owned(), id);
        }
        self
    }

    /// Sets how created servers behave.
    #[must_use]
    pub fn with_servers(self, behaviour: ServerBehaviour) -> Self {
        self.state().server_behaviour = behaviour;
        self
    }

    /// Registers a detached volume.
    #[must_use]
    pub fn with_volume(self, id: &str, name: &str, behaviour: AttachBehaviour) -> Self {
        self.state().volumes.push(FakeVolume {
            id: id.to_owned(),
            name: name.to_owned(),
            behaviour,
            attachments: Vec::new(),
            listed_on: None,
            detach_fails: false,
        });
        self
    }

    /// Registers a volume already attached to another server.
    #[must_use]
    pub fn with_attached_volume(self, id: &str, name: &str, server_id: &str) -> Self {
        self.state().volumes.push(FakeVolume {
            id: id.to_owned(),
            name: name.to_owned(),
            behaviour: AttachBehaviour::Normal,
            attachments: vec![VolumeAttachment {
                server_id: server_id.to_owned(),
                device: Some(String::from("/dev/vdz")),
            }],
            listed_on: Some(server_id.to_owned()),
            detach_fails: false,
        });
        self
    }

    /// Makes detaching `volume_id` fail.
    #[must_use]
    pub fn failing_detach(self, volume_id: &str) -> Self {
        if let Some(volume) = self
            .state()
            .volumes
            .iter_mut()
            .find(|volume| volume.id == volume_id)
        {
            volume.detach_fails = true;
        }
        self
    }

    /// Makes server deletion fail.
    #[must_use]
    pub fn failing_delete(self) -> Self {
        self.state().delete_fails = true;
        self
    }

    /// Makes snapshot creation fail.
    #[must_use]
    pub fn failing_snapshot(self) -> Self {
        self.state().snapshot_fails = true;
        self
    }

    /// Makes the volume listing fail.
    #[must_use]
    pub fn failing_volume_listing(self) -> Self {
        self.state().list_volumes_fails = true;
        self
    }

    /// Server requests received so far.
    #[must_use]
    pub fn created(&self) -> Vec<ServerRequest> {
        self.state().created.clone()
    }

    /// Server ids passed to `delete_server`, including failed attempts.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    /// Volume ids passed to `attach_volume`.
    #[must_use]
    pub fn attach_requests(&self) -> Vec<String> {
        self.state().attach_requests.clone()
    }

    /// Volume ids passed to `detach_volume`.
    #[must_use]
    pub fn detach_requests(&self) -> Vec<String> {
        self.state().detach_requests.clone()
    }

    /// `(server id, image name)` pairs passed to `create_snapshot`.
    #[must_use]
    pub fn snapshots(&self) -> Vec<(String, String)> {
        self.state().snapshots.clone()
    }

    fn find_named(map: &BTreeMap<String, String>, name: &str) -> Option<NamedResource> {
        map.get(name).map(|id| NamedResource {
            id: id.clone(),
            name: name.to_owned(),
        })
    }

    fn snapshot_of(&self, server_id: &str) -> Option<ServerSnapshot> {
        let mut state = self.state();
        let behaviour = state.server_behaviour.clone();
        let server = state.servers.get_mut(server_id)?;
        server.polls += 1;
        let (status, fault) = match behaviour {
            ServerBehaviour::Boots | ServerBehaviour::ReturnsNothing => (STATUS_ACTIVE, None),
            ServerBehaviour::BootsAfter(polls) if server.polls > polls => (STATUS_ACTIVE, None),
            ServerBehaviour::BootsAfter(_) | ServerBehaviour::NeverReady => ("BUILD", None),
            ServerBehaviour::Faults(fault) => (STATUS_ERROR, Some(fault)),
        };
        let mut addresses = BTreeMap::new();
        if status == STATUS_ACTIVE {
            addresses.insert(String::from("public"), vec![FAKE_SERVER_ADDRESS]);
        }
        Some(ServerSnapshot {
            id: server_id.to_owned(),
            status: status.to_owned(),
            addresses,
            fault,
        })
    }
}

fn done<'a, T: Send + 'a>(value: Result<T, FakeCloudError>) -> BackendFuture<'a, T, FakeCloudError> {
    Box::pin(ready(value))
}

impl Backend for FakeCloud {
    type Error = FakeCloudError;

    fn find_image<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error> {
        done(Ok(Self::find_named(&self.state().images, name)))
    }

    fn find_flavor<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error> {
        done(Ok(Self::find_named(&self.state().flavors, name)))
    }

    fn find_network<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error> {
        done(Ok(Self::find_named(&self.state().networks, name)))
    }

    fn create_server<'a>(
        &'a self,
        request: &'a ServerRequest,
    ) -> BackendFuture<'a, Option<ServerHandle>, Self::Error> {
        let mut state = self.state();
        state.created.push(request.clone());
        if state.server_behaviour == ServerBehaviour::ReturnsNothing {
            return done(Ok(None));
        }
        let id = format!("server-{}", state.created.len());
        state.servers.insert(
            id.clone(),
            FakeServer { polls: 0 },
        );
        done(Ok(Some(ServerHandle {
            id,
            name: request.name.clone(),
        })))
    }

    fn fetch_server<'a>(
        &'a self,
        server_id: &'a str,
    ) -> BackendFuture<'a, Option<ServerSnapshot>, Self::Error> {
        done(Ok(self.snapshot_of(server_id)))
    }

    fn delete_server<'a>(&'a self, server_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        let mut state = self.state();
        state.deleted.push(server_id.to_owned());
        if state.delete_fails {
            return done(Err(FakeCloudError(String::from("delete rejected"))));
        }
        state.servers.remove(server_id);
        done(Ok(()))
    }

    fn create_snapshot<'a>(
        &'a self,
        server_id: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, String, Self::Error> {
        let mut state = self.state();
        state
            .snapshots
            .push((server_id.to_owned(), name.to_owned()));
        if state.snapshot_fails {
            return done(Err(FakeCloudError(String::from("snapshot rejected"))));
        }
        let id = format!("snapshot-{}", state.snapshots.len());
        done(Ok(id))
    }

    fn image_status<'a>(
        &'a self,
        _image_id: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error> {
        done(Ok(Some(String::from("active"))))
    }
}

impl VolumeBackend for FakeCloud {
    fn list_volumes(&self) -> BackendFuture<'_, Vec<VolumeInfo>, Self::Error> {
        let state = self.state();
        if state.list_volumes_fails {
            return done(Err(FakeCloudError(String::from("volume service unavailable"))));
        }
        done(Ok(state
            .volumes
            .iter()
            .map(|volume| VolumeInfo {
                id: volume.id.clone(),
                name: volume.name.clone(),
                attachments: volume.attachments.clone(),
            })
            .collect()))
    }

    fn fetch_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, Option<VolumeInfo>, Self::Error> {
        let state = self.state();
        done(Ok(state
            .volumes
            .iter()
            .find(|volume| volume.id == volume_id)
            .map(|volume| VolumeInfo {
                id: volume.id.clone(),
                name: volume.name.clone(),
                attachments: volume.attachments.clone(),
            })))
    }

    fn attach_volume<'a>(
        &'a self,
        server_id: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.attach_requests.push(volume_id.to_owned());
        let Some(volume) = state
            .volumes
            .iter_mut()
            .find(|volume| volume.id == volume_id)
        else {
            return done(Err(FakeCloudError(format!("no volume {volume_id}"))));
        };

        let device = format!("/dev/vd{}", char::from(b'b' + state.next_device));
        match volume.behaviour {
            AttachBehaviour::Rejected => {
                return done(Err(FakeCloudError(String::from("attach rejected"))));
            }
            AttachBehaviour::NeverAppears => {}
            AttachBehaviour::HostDown => volume.listed_on = Some(server_id.to_owned()),
            AttachBehaviour::Normal | AttachBehaviour::DropsAfterFirstCheck => {
                volume.listed_on = Some(server_id.to_owned());
                volume.attachments.push(VolumeAttachment {
                    server_id: server_id.to_owned(),
                    device: Some(device),
                });
            }
        }
        state.next_device = state.next_device.saturating_add(1);
        done(Ok(()))
    }

    fn detach_volume<'a>(
        &'a self,
        server_id: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        let mut state = self.state();
        state.detach_requests.push(volume_id.to_owned());
        let Some(volume) = state
            .volumes
            .iter_mut()
            .find(|volume| volume.id == volume_id)
        else {
            return done(Err(FakeCloudError(format!("no volume {volume_id}"))));
        };
        if volume.detach_fails {
            return done(Err(FakeCloudError(format!("detach of {volume_id} rejected"))));
        }
        // Not attached to this server: already detached.
        volume
            .attachments
            .retain(|attachment| attachment.server_id != server_id);
        if volume.listed_on.as_deref() == Some(server_id) {
            volume.listed_on = None;
        }
        done(Ok(()))
    }

    fn list_attachments<'a>(
        &'a self,
        server_id: &'a str,
    ) -> BackendFuture<'a, Vec<String>, Self::Error> {
        let mut state = self.state();
        let mut listed = Vec::new();
        for volume in &mut state.volumes {
            if volume.listed_on.as_deref() != Some(server_id) {
                continue;
            }
            listed.push(volume.id.clone());
            if volume.behaviour == AttachBehaviour::DropsAfterFirstCheck {
                volume.listed_on = None;
                volume.attachments.clear();
            }
        }
        done(Ok(listed))
    }
}

/// Compliance suite returning pre-seeded outcomes in FIFO order.
///
/// Once the script runs out every further run returns an empty result set.
#[derive(Clone, Debug, Default)]
pub struct ScriptedSuite {
    outcomes: Arc<Mutex<VecDeque<Result<Vec<CheckResult>, SuiteError>>>>,
    runs: Arc<Mutex<Vec<ConnectionOptions>>>,
}

impl ScriptedSuite {
    /// Creates a suite with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful run returning `checks`.
    pub fn push_checks(&self, checks: Vec<CheckResult>) {
        lock(&self.outcomes).push_back(Ok(checks));
    }

    /// Queues a failed run.
    pub fn push_error(&self, error: SuiteError) {
        lock(&self.outcomes).push_back(Err(error));
    }

    /// Connection options of every run so far.
    #[must_use]
    pub fn runs(&self) -> Vec<ConnectionOptions> {
        lock(&self.runs).clone()
    }
}

impl ComplianceSuite for ScriptedSuite {
    fn run(
        &self,
        _suite: &Utf8Path,
        connection: &ConnectionOptions,
    ) -> Result<Vec<CheckResult>, SuiteError> {
        lock(&self.runs).push(connection.clone());
        lock(&self.outcomes)
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Builds a check result with a generated description.
#[must_use]
pub fn check(id: &str, status: CheckStatus) -> CheckResult {
    CheckResult {
        id: id.to_owned(),
        description: format!("{id} holds"),
        status,
        message: (status == CheckStatus::Failed).then(|| format!("{id} did not hold")),
    }
}
