use serde::Deserialize;

// ── Instance types ───────────────────────────────────────────────────

/// Parameters for `CreateInstance`. Optional fields are omitted from the
/// query when `None`.
#[derive(Debug, Clone, Default)]
pub struct CreateInstanceRequest {
    pub region_id: String,
    pub zone_id: Option<String>,
    pub image_id: String,
    pub instance_type: String,
    pub security_group_id: String,
    pub instance_name: Option<String>,
    pub password: String,
    pub internet_charge_type: String,
    pub internet_max_bandwidth_in: u32,
    pub internet_max_bandwidth_out: u32,
    pub io_optimized: Option<String>,
    pub vswitch_id: Option<String>,
}

impl CreateInstanceRequest {
    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("RegionId", self.region_id.clone()),
            ("ImageId", self.image_id.clone()),
            ("InstanceType", self.instance_type.clone()),
            ("SecurityGroupId", self.security_group_id.clone()),
            ("Password", self.password.clone()),
            ("InternetChargeType", self.internet_charge_type.clone()),
            (
                "InternetMaxBandwidthIn",
                self.internet_max_bandwidth_in.to_string(),
            ),
            (
                "InternetMaxBandwidthOut",
                self.internet_max_bandwidth_out.to_string(),
            ),
        ];
        let optional = [
            ("ZoneId", &self.zone_id),
            ("InstanceName", &self.instance_name),
            ("IoOptimized", &self.io_optimized),
            ("VSwitchId", &self.vswitch_id),
        ];
        for (key, value) in optional {
            if let Some(v) = value {
                params.push((key, v.clone()));
            }
        }
        params
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateInstanceResponse {
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpAddressSet {
    #[serde(default)]
    pub ip_address: Vec<String>,
}

/// Subset of `DescribeInstanceAttribute` used for status and addressing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceAttribute {
    pub instance_id: String,
    pub status: String,
    #[serde(default)]
    pub public_ip_address: IpAddressSet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocatePublicIpAddressResponse {
    pub ip_address: String,
}

// ── Security group types ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateSecurityGroupResponse {
    pub security_group_id: String,
}

/// One ingress permission, e.g. `tcp` `22/22` from `0.0.0.0/0`.
#[derive(Debug, Clone)]
pub struct AuthorizeSecurityGroupRequest {
    pub region_id: String,
    pub security_group_id: String,
    pub ip_protocol: String,
    pub port_range: String,
    pub source_cidr_ip: String,
}

impl AuthorizeSecurityGroupRequest {
    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("RegionId", self.region_id.clone()),
            ("SecurityGroupId", self.security_group_id.clone()),
            ("IpProtocol", self.ip_protocol.clone()),
            ("PortRange", self.port_range.clone()),
            ("SourceCidrIp", self.source_cidr_ip.clone()),
        ]
    }
}

// ── Common ───────────────────────────────────────────────────────────

/// Body of calls that only acknowledge.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Acknowledged {
    pub request_id: Option<String>,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
    pub request_id: Option<String>,
}
