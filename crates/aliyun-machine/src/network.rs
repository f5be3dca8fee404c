use std::net::{IpAddr, SocketAddr};

use tracing::debug;

use crate::control_plane::ControlPlane;
use crate::types::NetworkIdentity;
use crate::{Error, Result};

/// Port the container engine listens on.
pub const ENGINE_PORT: u16 = 2376;

/// Public addresses of `instance_id`.
///
/// Any failure, an unknown instance, or an empty address list is `NoAddress`.
pub async fn resolve(
    control_plane: &dyn ControlPlane,
    region: &str,
    instance_id: &str,
) -> Result<NetworkIdentity> {
    let status = match control_plane.describe_instance(region, instance_id).await {
        Ok(Some(status)) => status,
        Ok(None) => return Err(Error::NoAddress(instance_id.to_string())),
        Err(e) => {
            debug!(instance_id, error = %e, "describe failed while resolving address");
            return Err(Error::NoAddress(instance_id.to_string()));
        }
    };
    if status.public_addresses.is_empty() {
        return Err(Error::NoAddress(instance_id.to_string()));
    }
    Ok(NetworkIdentity {
        addresses: status.public_addresses,
    })
}

/// `tcp://host:2376`, bracketing IPv6 literals.
pub fn endpoint(address: &str) -> String {
    let host_port = match address.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, ENGINE_PORT).to_string(),
        Err(_) => format!("{address}:{ENGINE_PORT}"),
    };
    format!("tcp://{host_port}")
}
