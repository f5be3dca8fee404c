use async_trait::async_trait;

use crate::config::DriverConfig;
use crate::types::{IngressRule, InstanceDescriptor};

/// Opaque provider failure. The driver wraps it, it never looks inside.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    code: Option<String>,
    message: String,
    transient: bool,
}

impl ProviderError {
    /// An authoritative rejection.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            transient: false,
        }
    }

    /// A transport failure or throttling; retrying may succeed.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::new(message)
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl From<ecs_api::Error> for ProviderError {
    fn from(err: ecs_api::Error) -> Self {
        let transient = match &err {
            ecs_api::Error::Request(_) => true,
            ecs_api::Error::Api { status, code, .. } => {
                status.is_server_error() || code.starts_with("Throttling")
            }
        };
        Self {
            code: err.code().map(str::to_string),
            message: err.to_string(),
            transient,
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Status and public addresses reported for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub status: String,
    pub public_addresses: Vec<String>,
}

/// Everything `create_instance` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub region: String,
    pub zone: Option<String>,
    pub image: String,
    pub instance_type: String,
    pub security_group_id: String,
    pub name: String,
    pub password: String,
    pub internet_charge_type: String,
    pub io_optimized: Option<String>,
    pub vswitch_id: Option<String>,
}

impl InstanceSpec {
    pub fn for_descriptor(descriptor: &InstanceDescriptor, security_group_id: &str) -> Self {
        Self {
            region: descriptor.region.clone(),
            zone: descriptor.zone.clone(),
            image: descriptor.image.clone(),
            instance_type: descriptor.instance_type.clone(),
            security_group_id: security_group_id.to_string(),
            name: descriptor.name.clone(),
            password: descriptor.password.clone(),
            internet_charge_type: descriptor.internet_charge_type.clone(),
            io_optimized: descriptor.io_optimized.clone(),
            vswitch_id: descriptor.vswitch_id.clone(),
        }
    }
}

/// The control-plane operations the driver consumes.
///
/// `describe_instance` returns `Ok(None)` when the provider says the instance
/// does not exist; every other failure is a [`ProviderError`].
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn describe_instance(
        &self,
        region: &str,
        instance_id: &str,
    ) -> ProviderResult<Option<InstanceStatus>>;

    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<String>;

    async fn allocate_public_address(&self, instance_id: &str) -> ProviderResult<String>;

    async fn start_instance(&self, instance_id: &str) -> ProviderResult<()>;

    async fn stop_instance(&self, instance_id: &str, force: bool) -> ProviderResult<()>;

    async fn reboot_instance(&self, instance_id: &str, force: bool) -> ProviderResult<()>;

    async fn delete_instance(&self, instance_id: &str) -> ProviderResult<()>;

    async fn create_security_group(&self, region: &str, name: &str) -> ProviderResult<String>;

    async fn authorize_security_group(
        &self,
        region: &str,
        group_id: &str,
        rule: &IngressRule,
    ) -> ProviderResult<()>;

    async fn delete_security_group(&self, region: &str, group_id: &str) -> ProviderResult<()>;
}

const INTERNET_MAX_BANDWIDTH_IN: u32 = 10;
const INTERNET_MAX_BANDWIDTH_OUT: u32 = 10;

/// [`ControlPlane`] backed by the ECS RPC API.
pub struct EcsControlPlane {
    client: ecs_api::EcsClient,
}

impl EcsControlPlane {
    pub fn new(client: ecs_api::EcsClient) -> Self {
        Self { client }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        let client = ecs_api::EcsClient::new(&config.access_key_id, &config.access_key_secret)
            .with_endpoint(&config.endpoint);
        Self::new(client)
    }
}

#[async_trait]
impl ControlPlane for EcsControlPlane {
    async fn describe_instance(
        &self,
        _region: &str,
        instance_id: &str,
    ) -> ProviderResult<Option<InstanceStatus>> {
        match self.client.describe_instance_attribute(instance_id).await {
            Ok(attr) => Ok(Some(InstanceStatus {
                status: attr.status,
                public_addresses: attr.public_ip_address.ip_address,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> ProviderResult<String> {
        let req = ecs_api::CreateInstanceRequest {
            region_id: spec.region.clone(),
            zone_id: spec.zone.clone(),
            image_id: spec.image.clone(),
            instance_type: spec.instance_type.clone(),
            security_group_id: spec.security_group_id.clone(),
            instance_name: Some(spec.name.clone()),
            password: spec.password.clone(),
            internet_charge_type: spec.internet_charge_type.clone(),
            internet_max_bandwidth_in: INTERNET_MAX_BANDWIDTH_IN,
            internet_max_bandwidth_out: INTERNET_MAX_BANDWIDTH_OUT,
            io_optimized: spec.io_optimized.clone(),
            vswitch_id: spec.vswitch_id.clone(),
        };
        Ok(self.client.create_instance(&req).await?)
    }

    async fn allocate_public_address(&self, instance_id: &str) -> ProviderResult<String> {
        Ok(self.client.allocate_public_ip_address(instance_id).await?)
    }

    async fn start_instance(&self, instance_id: &str) -> ProviderResult<()> {
        Ok(self.client.start_instance(instance_id).await?)
    }

    async fn stop_instance(&self, instance_id: &str, force: bool) -> ProviderResult<()> {
        Ok(self.client.stop_instance(instance_id, force).await?)
    }

    async fn reboot_instance(&self, instance_id: &str, force: bool) -> ProviderResult<()> {
        Ok(self.client.reboot_instance(instance_id, force).await?)
    }

    async fn delete_instance(&self, instance_id: &str) -> ProviderResult<()> {
        Ok(self.client.delete_instance(instance_id).await?)
    }

    async fn create_security_group(&self, region: &str, name: &str) -> ProviderResult<String> {
        Ok(self
            .client
            .create_security_group(region, name, "docker-machine ingress rules")
            .await?)
    }

    async fn authorize_security_group(
        &self,
        region: &str,
        group_id: &str,
        rule: &IngressRule,
    ) -> ProviderResult<()> {
        let req = ecs_api::AuthorizeSecurityGroupRequest {
            region_id: region.to_string(),
            security_group_id: group_id.to_string(),
            ip_protocol: rule.protocol.clone(),
            port_range: rule.port_range.clone(),
            source_cidr_ip: rule.source_cidr.clone(),
        };
        Ok(self.client.authorize_security_group(&req).await?)
    }

    async fn delete_security_group(&self, region: &str, group_id: &str) -> ProviderResult<()> {
        Ok(self.client.delete_security_group(region, group_id).await?)
    }
}
