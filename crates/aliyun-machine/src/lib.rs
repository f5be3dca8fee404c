pub mod config;
pub mod control_plane;
pub mod credentials;
pub mod driver;
pub mod network;
pub mod poller;
pub mod security_group;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use config::{DriverConfig, WaitSettings};
pub use control_plane::{ControlPlane, EcsControlPlane, ProviderError};
pub use driver::Driver;
pub use store::MachineStore;
pub use types::{InstanceDescriptor, MachineState, NetworkIdentity, SecurityGroupRef};

use credentials::CredentialError;

pub const DRIVER_NAME: &str = "aliyun";

/// Control-plane call that was attempted when a `RemoteApi` error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    DescribeInstance,
    CreateInstance,
    AllocatePublicAddress,
    StartInstance,
    StopInstance,
    RestartInstance,
    DeleteInstance,
    CreateSecurityGroup,
    AuthorizeSecurityGroup,
    DeleteSecurityGroup,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DescribeInstance => "describe machine",
            Self::CreateInstance => "create machine",
            Self::AllocatePublicAddress => "allocate public ip address",
            Self::StartInstance => "start machine",
            Self::StopInstance => "stop machine",
            Self::RestartInstance => "restart machine",
            Self::DeleteInstance => "remove machine",
            Self::CreateSecurityGroup => "create security group",
            Self::AuthorizeSecurityGroup => "authorize security group",
            Self::DeleteSecurityGroup => "delete security group",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billable resource left behind by a failed compensating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Instance,
    SecurityGroup,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Instance => "instance",
            Self::SecurityGroup => "security group",
        })
    }
}

/// How loudly a rollback failure should be reported.
///
/// `Warning` is used when the primary operation still reached its goal
/// (the instance is gone) and only a secondary resource was left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Fatal,
}

/// Discriminant for branching on an [`Error`] without matching its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    AlreadyExists,
    RemoteApi,
    Rollback,
    Timeout,
    Cancelled,
    NotFound,
    NoAddress,
    KeyGeneration,
    KeyInjection,
    Store,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{option} must be specified using the environment variable {env}")]
    Config {
        option: &'static str,
        env: &'static str,
    },

    #[error("machine {name} already has instance {instance_id}")]
    AlreadyExists { name: String, instance_id: String },

    #[error("can not {action}: {source}")]
    RemoteApi {
        action: Action,
        #[source]
        source: ProviderError,
    },

    #[error(
        "{resource} {id} could not be deleted automatically, delete it manually: {source}{}",
        cause_suffix(.cause)
    )]
    Rollback {
        resource: Resource,
        id: String,
        severity: Severity,
        cause: Option<Box<Error>>,
        #[source]
        source: Box<Error>,
    },

    #[error("timed out waiting for {waiting_for} after {attempts} attempts ({elapsed:?})")]
    Timeout {
        waiting_for: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("cancelled while waiting for {waiting_for}")]
    Cancelled { waiting_for: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("no IP found for instance {0}")]
    NoAddress(String),

    #[error("can not generate key pair at {}: {source}", .path.display())]
    KeyGeneration {
        path: PathBuf,
        #[source]
        source: CredentialError,
    },

    #[error("can not install public key on {host}: {source}")]
    KeyInjection {
        host: String,
        #[source]
        source: CredentialError,
    },

    #[error("machine store {}: {source}", .path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("machine store {} is not a valid descriptor: {source}", .path.display())]
    StoreFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn cause_suffix(cause: &Option<Box<Error>>) -> String {
    match cause {
        Some(cause) => format!(" (rolling back after: {cause})"),
        None => String::new(),
    }
}

impl Error {
    pub(crate) fn remote(action: Action, source: ProviderError) -> Self {
        Self::RemoteApi { action, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::RemoteApi { .. } => ErrorKind::RemoteApi,
            Self::Rollback { .. } => ErrorKind::Rollback,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NoAddress(_) => ErrorKind::NoAddress,
            Self::KeyGeneration { .. } => ErrorKind::KeyGeneration,
            Self::KeyInjection { .. } => ErrorKind::KeyInjection,
            Self::Store { .. } | Self::StoreFormat { .. } => ErrorKind::Store,
        }
    }

    /// The control-plane action, for `RemoteApi` errors.
    pub fn action(&self) -> Option<Action> {
        match self {
            Self::RemoteApi { action, .. } => Some(*action),
            _ => None,
        }
    }

    /// Only transport-level control-plane failures are worth retrying.
    /// Authoritative rejections, timeouts and cancellations are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RemoteApi { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// A warning-level rollback: the operation finished but left a resource behind.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::Rollback {
                severity: Severity::Warning,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
