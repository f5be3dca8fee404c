//! In-memory collaborators for driver tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::Action;
use crate::control_plane::{ControlPlane, InstanceSpec, InstanceStatus, ProviderError, ProviderResult};
use crate::credentials::{CredentialError, KeyGenerator, RemoteShell, SshTarget, public_key_path};
use crate::types::IngressRule;

struct FakeInstance {
    /// Reported one per describe; the last entry sticks.
    statuses: VecDeque<&'static str>,
    addresses: Vec<String>,
    /// Set once deleted: describes left before the instance disappears.
    deleted_countdown: Option<u32>,
}

impl FakeInstance {
    fn new(status: &'static str) -> Self {
        Self {
            statuses: VecDeque::from([status]),
            addresses: Vec::new(),
            deleted_countdown: None,
        }
    }

    fn script(&mut self, statuses: &[&'static str]) {
        self.statuses = statuses.iter().copied().collect();
    }
}

#[derive(Default)]
pub struct FakeState {
    pub calls: Vec<(Action, String)>,
    pub specs: Vec<InstanceSpec>,
    groups: HashMap<String, Vec<IngressRule>>,
    instances: HashMap<String, FakeInstance>,
    failing: HashSet<Action>,
    failing_port_range: Option<String>,
    describe_errors: u32,
    linger_after_delete: u32,
    start_script: Option<Vec<&'static str>>,
    next_id: u32,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn record(&mut self, action: Action, target: &str) -> ProviderResult<()> {
        self.calls.push((action, target.to_string()));
        if self.failing.contains(&action) {
            return Err(ProviderError::new(format!("injected {action} failure")).with_code("Injected"));
        }
        Ok(())
    }

    fn instance(&mut self, instance_id: &str) -> ProviderResult<&mut FakeInstance> {
        self.instances
            .get_mut(instance_id)
            .filter(|i| i.deleted_countdown.is_none())
            .ok_or_else(|| ProviderError::new("instance not found").with_code("InvalidInstanceId.NotFound"))
    }
}

/// Recording [`ControlPlane`] with scripted statuses and failure injection.
///
/// Fresh instances report `Stopped`; starting scripts `Starting, Running`,
/// stopping scripts `Stopping, Stopped`. Deleted instances vanish on the
/// next describe unless [`FakeControlPlane::linger_after_delete`] is set.
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn fail(&self, action: Action) {
        self.with(|s| s.failing.insert(action));
    }

    pub fn fail_port_range(&self, port_range: &str) {
        self.with(|s| s.failing_port_range = Some(port_range.to_string()));
    }

    /// The next `n` describes fail transiently.
    pub fn fail_describes(&self, n: u32) {
        self.with(|s| s.describe_errors = n);
    }

    pub fn linger_after_delete(&self, describes: u32) {
        self.with(|s| s.linger_after_delete = describes);
    }

    /// Statuses reported after a start call, last one sticky.
    pub fn set_start_script(&self, statuses: &[&'static str]) {
        self.with(|s| s.start_script = Some(statuses.to_vec()));
    }

    pub fn seed_instance(&self, status: &'static str, addresses: &[&str]) -> String {
        self.with(|s| {
            let id = s.next("i");
            let mut instance = FakeInstance::new(status);
            instance.addresses = addresses.iter().map(|a| a.to_string()).collect();
            s.instances.insert(id.clone(), instance);
            id
        })
    }

    pub fn count(&self, action: Action) -> usize {
        self.with(|s| s.calls.iter().filter(|(a, _)| *a == action).count())
    }

    pub fn calls_of(&self, action: Action) -> Vec<String> {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|(a, _)| *a == action)
                .map(|(_, target)| target.clone())
                .collect()
        })
    }

    pub fn actions(&self) -> Vec<Action> {
        self.with(|s| s.calls.iter().map(|(a, _)| *a).collect())
    }

    pub fn group_exists(&self, group_id: &str) -> bool {
        self.with(|s| s.groups.contains_key(group_id))
    }

    pub fn group_count(&self) -> usize {
        self.with(|s| s.groups.len())
    }

    pub fn rules(&self, group_id: &str) -> Vec<IngressRule> {
        self.with(|s| s.groups.get(group_id).cloned().unwrap_or_default())
    }

    /// Instances that still exist (deleted ones excluded).
    pub fn instance_count(&self) -> usize {
        self.with(|s| {
            s.instances
                .values()
                .filter(|i| i.deleted_countdown.is_none())
                .count()
        })
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn describe_instance(
        &self,
        _region: &str,
        instance_id: &str,
    ) -> ProviderResult<Option<InstanceStatus>> {
        self.with(|s| {
            s.record(Action::DescribeInstance, instance_id)?;
            if s.describe_errors > 0 {
                s.describe_errors -= 1;
                return Err(ProviderError::transient("describe timed out"));
            }
            let Some(instance) = s.instances.get_mut(instance_id) else {
                return Ok(None);
            };
            if instance.deleted_countdown == Some(0) {
                s.instances.remove(instance_id);
                return Ok(None);
            }
            if let Some(n) = instance.deleted_countdown.as_mut() {
                *n -= 1;
            }
            let status = if instance.statuses.len() > 1 {
                instance.statuses.pop_front().unwrap_or("Stopped")
            } else {
                instance.statuses.front().copied().unwrap_or("Stopped")
            };
            Ok(Some(InstanceStatus {
                status: status.to_string(),
                public_addresses: instance.addresses.clone(),
            }))
        })
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<String> {
        self.with(|s| {
            s.record(Action::CreateInstance, &spec.name)?;
            s.specs.push(spec.clone());
            let id = s.next("i");
            s.instances.insert(id.clone(), FakeInstance::new("Stopped"));
            Ok(id)
        })
    }

    async fn allocate_public_address(&self, instance_id: &str) -> ProviderResult<String> {
        self.with(|s| {
            s.record(Action::AllocatePublicAddress, instance_id)?;
            let address = format!("47.93.0.{}", s.next_id % 250 + 1);
            s.instance(instance_id)?.addresses.push(address.clone());
            Ok(address)
        })
    }

    async fn start_instance(&self, instance_id: &str) -> ProviderResult<()> {
        self.with(|s| {
            s.record(Action::StartInstance, instance_id)?;
            let script = s
                .start_script
                .clone()
                .unwrap_or_else(|| vec!["Starting", "Running"]);
            s.instance(instance_id)?.script(&script);
            Ok(())
        })
    }

    async fn stop_instance(&self, instance_id: &str, _force: bool) -> ProviderResult<()> {
        self.with(|s| {
            s.record(Action::StopInstance, instance_id)?;
            s.instance(instance_id)?.script(&["Stopping", "Stopped"]);
            Ok(())
        })
    }

    async fn reboot_instance(&self, instance_id: &str, _force: bool) -> ProviderResult<()> {
        self.with(|s| {
            s.record(Action::RestartInstance, instance_id)?;
            s.instance(instance_id)?
                .script(&["Stopping", "Starting", "Running"]);
            Ok(())
        })
    }

    async fn delete_instance(&self, instance_id: &str) -> ProviderResult<()> {
        self.with(|s| {
            s.record(Action::DeleteInstance, instance_id)?;
            let linger = s.linger_after_delete;
            let instance = s.instance(instance_id)?;
            instance.script(&["Stopped"]);
            instance.deleted_countdown = Some(linger);
            Ok(())
        })
    }

    async fn create_security_group(&self, region: &str, name: &str) -> ProviderResult<String> {
        self.with(|s| {
            s.record(Action::CreateSecurityGroup, &format!("{region}/{name}"))?;
            let id = s.next("sg");
            s.groups.insert(id.clone(), Vec::new());
            Ok(id)
        })
    }

    async fn authorize_security_group(
        &self,
        _region: &str,
        group_id: &str,
        rule: &IngressRule,
    ) -> ProviderResult<()> {
        self.with(|s| {
            s.record(Action::AuthorizeSecurityGroup, group_id)?;
            if s.failing_port_range.as_deref() == Some(rule.port_range.as_str()) {
                return Err(ProviderError::new("invalid port range").with_code("InvalidPortRange.Malformed"));
            }
            s.groups
                .get_mut(group_id)
                .ok_or_else(|| ProviderError::new("group not found").with_code("InvalidSecurityGroupId.NotFound"))?
                .push(rule.clone());
            Ok(())
        })
    }

    async fn delete_security_group(&self, _region: &str, group_id: &str) -> ProviderResult<()> {
        self.with(|s| {
            s.record(Action::DeleteSecurityGroup, group_id)?;
            s.groups
                .remove(group_id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::new("group not found").with_code("InvalidSecurityGroupId.NotFound"))
        })
    }
}

fn failed(program: &'static str) -> CredentialError {
    CredentialError::Failed {
        program,
        status: "exit status: 255".into(),
        stderr: "connection refused".into(),
    }
}

/// Records requested key paths instead of running `ssh-keygen`.
#[derive(Default)]
pub struct FakeKeygen {
    paths: Mutex<Vec<PathBuf>>,
    fail: Mutex<bool>,
}

impl FakeKeygen {
    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyGenerator for FakeKeygen {
    async fn generate(&self, private_key: &Path) -> Result<PathBuf, CredentialError> {
        self.paths.lock().unwrap().push(private_key.to_path_buf());
        if *self.fail.lock().unwrap() {
            return Err(failed("ssh-keygen"));
        }
        Ok(public_key_path(private_key))
    }
}

#[derive(Default)]
struct ShellState {
    copies: Vec<(String, String)>,
    copy_attempts: u32,
    copy_failures: u32,
    commands: Vec<(String, String)>,
    fail_run: bool,
}

/// Records copies and commands instead of talking SSH.
#[derive(Default)]
pub struct FakeShell {
    state: Mutex<ShellState>,
}

impl FakeShell {
    /// The next `n` copies fail as if the host were unreachable.
    pub fn fail_copies(&self, n: u32) {
        self.state.lock().unwrap().copy_failures = n;
    }

    pub fn fail_run(&self) {
        self.state.lock().unwrap().fail_run = true;
    }

    /// Successful copies as `(host, remote path)`.
    pub fn copies(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().copies.clone()
    }

    pub fn copy_attempts(&self) -> u32 {
        self.state.lock().unwrap().copy_attempts
    }

    /// Commands run as `(host, command)`.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().commands.clone()
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn copy(
        &self,
        target: &SshTarget,
        _local: &Path,
        remote: &str,
    ) -> Result<(), CredentialError> {
        let mut state = self.state.lock().unwrap();
        state.copy_attempts += 1;
        if state.copy_failures > 0 {
            state.copy_failures -= 1;
            return Err(failed("scp"));
        }
        state.copies.push((target.host.clone(), remote.to_string()));
        Ok(())
    }

    async fn run(&self, target: &SshTarget, command: &str) -> Result<String, CredentialError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push((target.host.clone(), command.to_string()));
        if state.fail_run {
            return Err(failed("ssh"));
        }
        Ok(String::new())
    }
}
