//! Typed Rust client for the ECS control-plane RPC API.
//!
//! Covers the subset needed to run a single container host:
//! instances (describe, create, allocate address, start, stop, reboot,
//! delete) and security groups (create, authorize, delete).

mod sign;
mod types;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;

pub use types::*;

pub const DEFAULT_ENDPOINT: &str = "ecs.aliyuncs.com";
const API_VERSION: &str = "2014-05-26";

/// Limit for one API call, connect to last byte.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ecs api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("ecs api {action} returned {status}: {code}: {message}")]
    Api {
        action: &'static str,
        status: reqwest::StatusCode,
        code: String,
        message: String,
        request_id: Option<String>,
    },
}

impl Error {
    /// Provider error code, if the API answered with one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } if !code.is_empty() => Some(code),
            _ => None,
        }
    }

    /// The addressed resource does not exist (any `*.NotFound` code or a 404).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Api { status, code, .. } => {
                status.as_u16() == 404 || code.ends_with(".NotFound")
            }
            Self::Request(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for the ECS RPC API, signing every call with `ACS3-HMAC-SHA256`.
#[derive(Clone)]
pub struct EcsClient {
    access_key_id: String,
    access_key_secret: String,
    endpoint: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl EcsClient {
    pub fn new(access_key_id: impl Into<String>, access_key_secret: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            access_key_secret: access_key_secret.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the endpoint. Accepts a bare host (`ecs.cn-beijing.aliyuncs.com`)
    /// or a full base URL (`http://127.0.0.1:8080`).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn base_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        }
    }

    fn host(&self) -> &str {
        let endpoint = self.endpoint.trim_end_matches('/');
        endpoint
            .split_once("://")
            .map_or(endpoint, |(_, host)| host)
    }

    async fn check(resp: reqwest::Response, action: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::api_error(action, status, &body));
        }
        Ok(resp)
    }

    fn api_error(action: &'static str, status: reqwest::StatusCode, body: &str) -> Error {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(err) => Error::Api {
                action,
                status,
                code: err.code,
                message: err.message,
                request_id: err.request_id,
            },
            Err(_) => Error::Api {
                action,
                status,
                code: String::new(),
                message: body.to_string(),
                request_id: None,
            },
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        action: &'static str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let query = sign::canonical_query(params);
        let payload_hash = sign::sha256_hex(b"");

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), self.host().to_string());
        headers.insert("x-acs-action".to_string(), action.to_string());
        headers.insert("x-acs-content-sha256".to_string(), payload_hash.clone());
        headers.insert(
            "x-acs-date".to_string(),
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        headers.insert(
            "x-acs-signature-nonce".to_string(),
            uuid::Uuid::new_v4().to_string(),
        );
        headers.insert("x-acs-version".to_string(), API_VERSION.to_string());

        let authorization = sign::authorization(
            &self.access_key_id,
            &self.access_key_secret,
            "POST",
            &query,
            &headers,
            &payload_hash,
        );

        debug!(action, endpoint = %self.endpoint, "ecs api call");

        let mut req = self
            .http
            .post(format!("{}/?{query}", self.base_url()))
            .timeout(self.timeout);
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.header("Authorization", authorization).send().await?;

        Self::check(resp, action)
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    // ── Instances ────────────────────────────────────────────────────

    pub async fn describe_instance_attribute(&self, instance_id: &str) -> Result<InstanceAttribute> {
        self.call(
            "DescribeInstanceAttribute",
            &[("InstanceId", instance_id.to_string())],
        )
        .await
    }

    pub async fn create_instance(&self, req: &CreateInstanceRequest) -> Result<String> {
        let resp: CreateInstanceResponse = self.call("CreateInstance", &req.params()).await?;
        Ok(resp.instance_id)
    }

    pub async fn allocate_public_ip_address(&self, instance_id: &str) -> Result<String> {
        let resp: AllocatePublicIpAddressResponse = self
            .call(
                "AllocatePublicIpAddress",
                &[("InstanceId", instance_id.to_string())],
            )
            .await?;
        Ok(resp.ip_address)
    }

    pub async fn start_instance(&self, instance_id: &str) -> Result<()> {
        let _: Acknowledged = self
            .call("StartInstance", &[("InstanceId", instance_id.to_string())])
            .await?;
        Ok(())
    }

    pub async fn stop_instance(&self, instance_id: &str, force: bool) -> Result<()> {
        let _: Acknowledged = self
            .call(
                "StopInstance",
                &[
                    ("InstanceId", instance_id.to_string()),
                    ("ForceStop", force.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn reboot_instance(&self, instance_id: &str, force: bool) -> Result<()> {
        let _: Acknowledged = self
            .call(
                "RebootInstance",
                &[
                    ("InstanceId", instance_id.to_string()),
                    ("ForceStop", force.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let _: Acknowledged = self
            .call("DeleteInstance", &[("InstanceId", instance_id.to_string())])
            .await?;
        Ok(())
    }

    // ── Security groups ──────────────────────────────────────────────

    pub async fn create_security_group(
        &self,
        region_id: &str,
        name: &str,
        description: &str,
    ) -> Result<String> {
        let resp: CreateSecurityGroupResponse = self
            .call(
                "CreateSecurityGroup",
                &[
                    ("RegionId", region_id.to_string()),
                    ("SecurityGroupName", name.to_string()),
                    ("Description", description.to_string()),
                ],
            )
            .await?;
        Ok(resp.security_group_id)
    }

    pub async fn authorize_security_group(&self, req: &AuthorizeSecurityGroupRequest) -> Result<()> {
        let _: Acknowledged = self.call("AuthorizeSecurityGroup", &req.params()).await?;
        Ok(())
    }

    pub async fn delete_security_group(&self, region_id: &str, security_group_id: &str) -> Result<()> {
        let _: Acknowledged = self
            .call(
                "DeleteSecurityGroup",
                &[
                    ("RegionId", region_id.to_string()),
                    ("SecurityGroupId", security_group_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}
