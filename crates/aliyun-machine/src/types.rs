use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DriverConfig;
use crate::{Error, Result};

/// Identity and desired configuration of the one instance a [`crate::Driver`] manages.
///
/// `instance_id` is set once, when the instance is created, and cleared only
/// when it is removed (or rolled back).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub name: String,
    pub instance_id: Option<String>,
    pub region: String,
    pub zone: Option<String>,
    pub image: String,
    pub instance_type: String,
    pub password: String,
    pub internet_charge_type: String,
    pub io_optimized: Option<String>,
    pub vswitch_id: Option<String>,
    pub security_group: Option<SecurityGroupRef>,
    #[serde(default)]
    pub cluster_coordinator: bool,
    pub ip_address: Option<String>,
}

impl InstanceDescriptor {
    /// A fresh descriptor for `name`, nothing created yet.
    ///
    /// A configured security group is recorded as caller-supplied so it is
    /// never deleted on removal.
    pub fn from_config(name: impl Into<String>, config: &DriverConfig) -> Self {
        Self {
            name: name.into(),
            instance_id: None,
            region: config.region_id.clone(),
            zone: config.zone_id.clone(),
            image: config.image_id.clone(),
            instance_type: config.instance_type.clone(),
            password: config.root_password.clone(),
            internet_charge_type: config.internet_charge_type.clone(),
            io_optimized: Some(config.io_optimized.clone()).filter(|s| !s.is_empty()),
            vswitch_id: config.vswitch_id.clone(),
            security_group: config
                .security_group_id
                .clone()
                .map(SecurityGroupRef::supplied),
            cluster_coordinator: config.cluster_coordinator,
            ip_address: None,
        }
    }

    /// The instance ID, or `NotFound` if nothing has been created.
    pub fn require_id(&self) -> Result<&str> {
        self.instance_id
            .as_deref()
            .ok_or_else(|| Error::NotFound(format!("machine {}", self.name)))
    }

    /// Name of the group created for this machine when none is supplied.
    pub fn group_name(&self) -> String {
        format!("docker-machine-{}", self.name)
    }
}

/// A security group plus who owns its teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRef {
    pub id: String,
    /// Created by this driver during `create()`; deleted once the instance is gone.
    pub ephemeral: bool,
}

impl SecurityGroupRef {
    pub fn supplied(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ephemeral: false,
        }
    }

    pub fn ephemeral(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ephemeral: true,
        }
    }
}

/// Canonical machine state, always derived from the provider status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Absent,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl MachineState {
    /// Total mapping of a provider status. Anything unrecognised is `Absent`.
    pub fn from_status(status: &str) -> Self {
        match status {
            "Running" => Self::Running,
            "Starting" => Self::Starting,
            "Stopping" => Self::Stopping,
            "Stopped" => Self::Stopped,
            "ERROR" => Self::Error,
            _ => Self::Absent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "Absent",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule opened on a security group: protocol, `from/to` port range, source CIDR.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngressRule {
    pub protocol: String,
    pub port_range: String,
    pub source_cidr: String,
}

impl IngressRule {
    /// A single TCP port open to any source.
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: "tcp".into(),
            port_range: format!("{port}/{port}"),
            source_cidr: "0.0.0.0/0".into(),
        }
    }
}

/// Public addresses of an instance as of one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkIdentity {
    pub addresses: Vec<String>,
}

impl NetworkIdentity {
    /// The address used for endpoints and SSH.
    pub fn primary(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }
}
