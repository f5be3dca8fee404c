use std::fmt;
use std::time::Duration;

use crate::poller::PollConfig;
use crate::{Error, Result};

pub const DEFAULT_REGION_ID: &str = "cn-beijing";
pub const DEFAULT_IMAGE_ID: &str = "ubuntu1404_64_20G_aliaegis_20150325.vhd";
pub const DEFAULT_INSTANCE_TYPE: &str = "ecs.t1.small";
pub const DEFAULT_INTERNET_CHARGE_TYPE: &str = "PayByTraffic";
pub const DEFAULT_ROOT_PASSWORD: &str = "Password520";
pub const DEFAULT_IO_OPTIMIZED: &str = "none";

/// Options recognised by the driver.
///
/// Credentials are mandatory; everything else has a default or is optional.
#[derive(Clone)]
pub struct DriverConfig {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub region_id: String,
    pub zone_id: Option<String>,
    pub image_id: String,
    pub instance_type: String,
    pub security_group_id: Option<String>,
    pub internet_charge_type: String,
    pub root_password: String,
    pub io_optimized: String,
    pub vswitch_id: Option<String>,
    pub cluster_coordinator: bool,
    pub endpoint: String,
    pub wait: WaitSettings,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            access_key_secret: String::new(),
            region_id: DEFAULT_REGION_ID.into(),
            zone_id: None,
            image_id: DEFAULT_IMAGE_ID.into(),
            instance_type: DEFAULT_INSTANCE_TYPE.into(),
            security_group_id: None,
            internet_charge_type: DEFAULT_INTERNET_CHARGE_TYPE.into(),
            root_password: DEFAULT_ROOT_PASSWORD.into(),
            io_optimized: DEFAULT_IO_OPTIMIZED.into(),
            vswitch_id: None,
            cluster_coordinator: false,
            endpoint: ecs_api::DEFAULT_ENDPOINT.into(),
            wait: WaitSettings::default(),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("access_key_id", &self.access_key_id)
            .field("access_key_secret", &"<redacted>")
            .field("region_id", &self.region_id)
            .field("zone_id", &self.zone_id)
            .field("image_id", &self.image_id)
            .field("instance_type", &self.instance_type)
            .field("security_group_id", &self.security_group_id)
            .field("internet_charge_type", &self.internet_charge_type)
            .field("root_password", &"<redacted>")
            .field("io_optimized", &self.io_optimized)
            .field("vswitch_id", &self.vswitch_id)
            .field("cluster_coordinator", &self.cluster_coordinator)
            .field("endpoint", &self.endpoint)
            .field("wait", &self.wait)
            .finish()
    }
}

impl DriverConfig {
    /// Load from env vars (after `.env`, if present):
    ///
    /// - `ECS_ACCESS_KEY_ID`, `ECS_ACCESS_KEY_SECRET` (required)
    /// - `ECS_REGION_ID` (default: `"cn-beijing"`)
    /// - `ECS_ZONE_ID`, `ECS_VSWITCH_ID` (optional)
    /// - `ECS_IMAGE_ID`, `ECS_INSTANCE_TYPE`, `ECS_INTERNET_CHARGE_TYPE`,
    ///   `ECS_ROOT_PASSWORD`, `ECS_IO_OPTIMIZED` (defaulted)
    /// - `ECS_SECURITY_GROUP_ID` or `SECURITY_GROUP_ID` (optional; disables group creation)
    /// - `ECS_CLUSTER_COORDINATOR` (bool, default false)
    /// - `ECS_ENDPOINT` (default: `"ecs.aliyuncs.com"`)
    /// - `ECS_ACTIVE_TIMEOUT_SECS`, `ECS_STOPPED_TIMEOUT_SECS`, `ECS_ABSENT_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: Duration| {
            get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(default, Duration::from_secs)
        };

        let defaults = WaitSettings::default();
        let wait = WaitSettings {
            active: defaults
                .active
                .with_timeout(secs("ECS_ACTIVE_TIMEOUT_SECS", ACTIVE_TIMEOUT)),
            stopped: defaults
                .stopped
                .with_timeout(secs("ECS_STOPPED_TIMEOUT_SECS", STOPPED_TIMEOUT)),
            absent: defaults
                .absent
                .with_timeout(secs("ECS_ABSENT_TIMEOUT_SECS", ABSENT_TIMEOUT)),
            ..defaults
        };

        Self {
            access_key_id: get("ECS_ACCESS_KEY_ID").unwrap_or_default(),
            access_key_secret: get("ECS_ACCESS_KEY_SECRET").unwrap_or_default(),
            region_id: or("ECS_REGION_ID", DEFAULT_REGION_ID),
            zone_id: get("ECS_ZONE_ID"),
            image_id: or("ECS_IMAGE_ID", DEFAULT_IMAGE_ID),
            instance_type: or("ECS_INSTANCE_TYPE", DEFAULT_INSTANCE_TYPE),
            security_group_id: get("ECS_SECURITY_GROUP_ID").or_else(|| get("SECURITY_GROUP_ID")),
            internet_charge_type: or("ECS_INTERNET_CHARGE_TYPE", DEFAULT_INTERNET_CHARGE_TYPE),
            root_password: or("ECS_ROOT_PASSWORD", DEFAULT_ROOT_PASSWORD),
            io_optimized: or("ECS_IO_OPTIMIZED", DEFAULT_IO_OPTIMIZED),
            vswitch_id: get("ECS_VSWITCH_ID"),
            cluster_coordinator: get("ECS_CLUSTER_COORDINATOR")
                .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")),
            endpoint: or("ECS_ENDPOINT", ecs_api::DEFAULT_ENDPOINT),
            wait,
        }
    }

    /// Fails on missing credentials, before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        if self.access_key_id.trim().is_empty() {
            return Err(Error::Config {
                option: "Aliyun Access Key Id",
                env: "ECS_ACCESS_KEY_ID",
            });
        }
        if self.access_key_secret.trim().is_empty() {
            return Err(Error::Config {
                option: "Aliyun Access Key Secret",
                env: "ECS_ACCESS_KEY_SECRET",
            });
        }
        Ok(())
    }
}

const ACTIVE_TIMEOUT: Duration = Duration::from_secs(600);
const STOPPED_TIMEOUT: Duration = Duration::from_secs(300);
const ABSENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Poll cadence and bounds for each wait, plus SSH readiness retries.
#[derive(Debug, Clone)]
pub struct WaitSettings {
    pub active: PollConfig,
    pub stopped: PollConfig,
    pub absent: PollConfig,
    pub ssh_attempts: u32,
    pub ssh_retry_delay: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            active: PollConfig::every(Duration::from_secs(10)).with_timeout(ACTIVE_TIMEOUT),
            stopped: PollConfig::every(Duration::from_secs(3)).with_timeout(STOPPED_TIMEOUT),
            absent: PollConfig::every(Duration::from_secs(1)).with_timeout(ABSENT_TIMEOUT),
            ssh_attempts: 6,
            ssh_retry_delay: Duration::from_secs(5),
        }
    }
}
