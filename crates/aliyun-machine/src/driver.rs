//! Lifecycle of one ECS instance: create, start, stop, restart, remove.
//!
//! `create()` walks group → key pair → instance → public address → start →
//! running → key installed. Once the instance exists every failure deletes it
//! again before the error is returned; a failed delete becomes
//! [`Error::Rollback`] so the orphan is never silent.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DriverConfig;
use crate::control_plane::{ControlPlane, EcsControlPlane, InstanceSpec};
use crate::credentials::{
    self, CredentialInjector, KeyGenerator, RemoteShell, SshKeygen, SshPassShell, SshTarget,
};
use crate::poller::{self, PollConfig};
use crate::security_group;
use crate::types::{InstanceDescriptor, MachineState, SecurityGroupRef};
use crate::{Action, DRIVER_NAME, Error, Resource, Result, Severity, network};

pub struct Driver {
    config: DriverConfig,
    descriptor: InstanceDescriptor,
    key_path: PathBuf,
    control_plane: Arc<dyn ControlPlane>,
    keygen: Arc<dyn KeyGenerator>,
    shell: Arc<dyn RemoteShell>,
    cancel: CancellationToken,
}

impl Driver {
    /// Fails with `Config` on missing credentials, before any remote call.
    pub fn new(
        config: DriverConfig,
        descriptor: InstanceDescriptor,
        key_path: impl Into<PathBuf>,
        control_plane: Arc<dyn ControlPlane>,
        keygen: Arc<dyn KeyGenerator>,
        shell: Arc<dyn RemoteShell>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            descriptor,
            key_path: key_path.into(),
            control_plane,
            keygen,
            shell,
            cancel: CancellationToken::new(),
        })
    }

    /// Production wiring: ECS API, `ssh-keygen`, `sshpass`.
    pub fn for_ecs(
        config: DriverConfig,
        descriptor: InstanceDescriptor,
        key_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        config.validate()?;
        let control_plane = Arc::new(EcsControlPlane::from_config(&config));
        Self::new(
            config,
            descriptor,
            key_path,
            control_plane,
            Arc::new(SshKeygen::default()),
            Arc::new(SshPassShell::default()),
        )
    }

    /// Cancelling `cancel` interrupts any in-progress wait.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> InstanceDescriptor {
        self.descriptor
    }

    pub fn driver_name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn ssh_user(&self) -> &'static str {
        credentials::SSH_USER
    }

    pub fn ssh_port(&self) -> u16 {
        credentials::SSH_PORT
    }

    pub fn ssh_key_path(&self) -> &Path {
        &self.key_path
    }

    pub async fn ssh_hostname(&self) -> Result<String> {
        self.ip().await
    }

    /// First public address, freshly resolved.
    pub async fn ip(&self) -> Result<String> {
        let instance_id = self.descriptor.require_id()?;
        let identity =
            network::resolve(self.control_plane.as_ref(), &self.descriptor.region, instance_id)
                .await?;
        identity
            .primary()
            .map(str::to_string)
            .ok_or_else(|| Error::NoAddress(instance_id.to_string()))
    }

    /// Container engine endpoint, `tcp://<ip>:2376`.
    pub async fn url(&self) -> Result<String> {
        Ok(network::endpoint(&self.ip().await?))
    }

    /// Current state as reported by the control plane. `Absent` before create.
    pub async fn state(&self) -> Result<MachineState> {
        match self.descriptor.instance_id.as_deref() {
            Some(instance_id) => self.query_state(instance_id).await,
            None => Ok(MachineState::Absent),
        }
    }

    async fn query_state(&self, instance_id: &str) -> Result<MachineState> {
        let status = self
            .control_plane
            .describe_instance(&self.descriptor.region, instance_id)
            .await
            .map_err(|source| Error::remote(Action::DescribeInstance, source))?;
        Ok(status.map_or(MachineState::Absent, |s| MachineState::from_status(&s.status)))
    }

    async fn wait_for(
        &self,
        instance_id: &str,
        target: MachineState,
        config: &PollConfig,
    ) -> Result<()> {
        poller::wait_for_state(instance_id, target, config, &self.cancel, move || {
            self.query_state(instance_id)
        })
        .await
    }

    // ── Create ──────────────────────────────────────────────────────────

    pub async fn create(&mut self) -> Result<()> {
        if let Some(instance_id) = &self.descriptor.instance_id {
            return Err(Error::AlreadyExists {
                name: self.descriptor.name.clone(),
                instance_id: instance_id.clone(),
            });
        }
        info!(name = %self.descriptor.name, region = %self.descriptor.region, "creating machine");

        let (group, created_group) = match self.descriptor.security_group.clone() {
            Some(group) => (group, false),
            None => {
                let group = security_group::create_group(
                    self.control_plane.as_ref(),
                    &self.descriptor.region,
                    &self.descriptor.group_name(),
                    self.descriptor.cluster_coordinator,
                )
                .await?;
                self.descriptor.security_group = Some(group.clone());
                (group, true)
            }
        };

        let public_key = match self.keygen.generate(&self.key_path).await {
            Ok(path) => path,
            Err(source) => {
                let cause = Error::KeyGeneration {
                    path: self.key_path.clone(),
                    source,
                };
                return Err(self.discard_group(created_group, cause).await);
            }
        };

        let spec = InstanceSpec::for_descriptor(&self.descriptor, &group.id);
        let instance_id = match self.control_plane.create_instance(&spec).await {
            Ok(id) => id,
            Err(source) => {
                let cause = Error::remote(Action::CreateInstance, source);
                return Err(self.discard_group(created_group, cause).await);
            }
        };
        info!(%instance_id, group_id = %group.id, "instance created");
        self.descriptor.instance_id = Some(instance_id.clone());

        if let Err(cause) = self.provision(&instance_id, &public_key).await {
            return Err(self.roll_back_instance(&instance_id, cause).await);
        }
        info!(%instance_id, "machine ready");
        Ok(())
    }

    /// Everything after the instance exists.
    async fn provision(&mut self, instance_id: &str, public_key: &Path) -> Result<()> {
        let address = self
            .control_plane
            .allocate_public_address(instance_id)
            .await
            .map_err(|source| Error::remote(Action::AllocatePublicAddress, source))?;
        info!(instance_id, %address, "public address allocated");
        self.descriptor.ip_address = Some(address.clone());

        self.control_plane
            .start_instance(instance_id)
            .await
            .map_err(|source| Error::remote(Action::StartInstance, source))?;

        info!(instance_id, "waiting for instance to become active");
        self.wait_for(instance_id, MachineState::Running, &self.config.wait.active)
            .await?;

        let target = SshTarget::root(address, self.descriptor.password.clone());
        CredentialInjector::new(self.shell.as_ref(), &self.config.wait, &self.cancel)
            .install(&target, public_key)
            .await
    }

    /// Delete a half-provisioned instance, returning the error to surface.
    async fn roll_back_instance(&mut self, instance_id: &str, cause: Error) -> Error {
        warn!(instance_id, error = %cause, "create failed, deleting instance");
        match self.control_plane.delete_instance(instance_id).await {
            Ok(()) => {
                self.descriptor.instance_id = None;
                self.descriptor.ip_address = None;
                if let Some(group) = self.descriptor.security_group.as_ref().filter(|g| g.ephemeral) {
                    warn!(group_id = %group.id, "security group kept, run remove to delete it");
                }
                cause
            }
            Err(source) => {
                error!(instance_id, error = %source, "rollback failed, instance must be deleted manually");
                Error::Rollback {
                    resource: Resource::Instance,
                    id: instance_id.to_string(),
                    severity: Severity::Fatal,
                    cause: Some(Box::new(cause)),
                    source: Box::new(Error::remote(Action::DeleteInstance, source)),
                }
            }
        }
    }

    /// Delete the group created by this call when nothing else was created.
    async fn discard_group(&mut self, created_group: bool, cause: Error) -> Error {
        if !created_group {
            return cause;
        }
        let Some(group) = self.descriptor.security_group.clone() else {
            return cause;
        };
        match security_group::delete_group(
            self.control_plane.as_ref(),
            &self.descriptor.region,
            &group,
        )
        .await
        {
            Ok(()) => {
                self.descriptor.security_group = None;
                cause
            }
            Err(source) => {
                error!(group_id = %group.id, error = %source, "could not delete security group");
                Error::Rollback {
                    resource: Resource::SecurityGroup,
                    id: group.id,
                    severity: Severity::Fatal,
                    cause: Some(Box::new(cause)),
                    source: Box::new(source),
                }
            }
        }
    }

    // ── Passthroughs ────────────────────────────────────────────────────

    pub async fn start(&self) -> Result<()> {
        let instance_id = self.descriptor.require_id()?;
        info!(instance_id, "starting instance");
        self.control_plane
            .start_instance(instance_id)
            .await
            .map_err(|source| Error::remote(Action::StartInstance, source))
    }

    pub async fn stop(&self, force: bool) -> Result<()> {
        let instance_id = self.descriptor.require_id()?;
        info!(instance_id, force, "stopping instance");
        self.control_plane
            .stop_instance(instance_id, force)
            .await
            .map_err(|source| Error::remote(Action::StopInstance, source))
    }

    pub async fn restart(&self, force: bool) -> Result<()> {
        let instance_id = self.descriptor.require_id()?;
        info!(instance_id, force, "restarting instance");
        self.control_plane
            .reboot_instance(instance_id, force)
            .await
            .map_err(|source| Error::remote(Action::RestartInstance, source))
    }

    pub async fn kill(&self) -> Result<()> {
        self.stop(true).await
    }

    // ── Remove ──────────────────────────────────────────────────────────

    /// Stop (if running) and delete the instance, then delete an ephemeral
    /// group once the instance is gone.
    ///
    /// With no instance left but an ephemeral group still recorded (a rolled
    /// back create, or an earlier failed group delete) only the group is
    /// deleted. An instance already gone at the provider still gets its
    /// group deleted before `NotFound` is returned.
    pub async fn remove(&mut self) -> Result<()> {
        let Some(instance_id) = self.descriptor.instance_id.clone() else {
            return match self.descriptor.security_group.clone() {
                Some(group) if group.ephemeral => self.remove_group(&group).await,
                _ => Err(Error::NotFound(format!("machine {}", self.descriptor.name))),
            };
        };

        let state = self.query_state(&instance_id).await?;
        if state == MachineState::Absent {
            warn!(%instance_id, "instance already gone");
            self.descriptor.instance_id = None;
            self.descriptor.ip_address = None;
            if let Some(group) = self.descriptor.security_group.clone().filter(|g| g.ephemeral) {
                self.remove_group(&group).await?;
            }
            return Err(Error::NotFound(format!("instance {instance_id}")));
        }
        if state == MachineState::Running {
            info!(%instance_id, "stopping instance before removal");
            self.control_plane
                .stop_instance(&instance_id, true)
                .await
                .map_err(|source| Error::remote(Action::StopInstance, source))?;
            self.wait_for(&instance_id, MachineState::Stopped, &self.config.wait.stopped)
                .await?;
        }

        info!(%instance_id, "deleting instance");
        self.control_plane
            .delete_instance(&instance_id)
            .await
            .map_err(|source| Error::remote(Action::DeleteInstance, source))?;
        self.descriptor.instance_id = None;
        self.descriptor.ip_address = None;

        match self.descriptor.security_group.clone() {
            Some(group) if group.ephemeral => {
                self.wait_for(&instance_id, MachineState::Absent, &self.config.wait.absent)
                    .await?;
                self.remove_group(&group).await
            }
            _ => Ok(()),
        }
    }

    async fn remove_group(&mut self, group: &SecurityGroupRef) -> Result<()> {
        match security_group::delete_group(
            self.control_plane.as_ref(),
            &self.descriptor.region,
            group,
        )
        .await
        {
            Ok(()) => {
                self.descriptor.security_group = None;
                Ok(())
            }
            Err(source) => {
                warn!(group_id = %group.id, error = %source, "security group left behind, delete it manually");
                Err(Error::Rollback {
                    resource: Resource::SecurityGroup,
                    id: group.id.clone(),
                    severity: Severity::Warning,
                    cause: None,
                    source: Box::new(source),
                })
            }
        }
    }
}
