//! Ephemeral security groups: created fully authorized, or not at all.

use tracing::{error, info, warn};

use crate::control_plane::ControlPlane;
use crate::network::ENGINE_PORT;
use crate::types::{IngressRule, SecurityGroupRef};
use crate::{Action, Error, Resource, Result, Severity};

pub const SSH_PORT: u16 = 22;
/// Opened only on cluster coordinators.
pub const COORDINATOR_PORT: u16 = 3376;

/// Ingress rules a container host needs.
pub fn required_rules(cluster_coordinator: bool) -> Vec<IngressRule> {
    let mut rules = vec![IngressRule::tcp(SSH_PORT), IngressRule::tcp(ENGINE_PORT)];
    if cluster_coordinator {
        rules.push(IngressRule::tcp(COORDINATOR_PORT));
    }
    rules
}

/// Create a group in `region` and authorize every required rule.
///
/// The first failed authorization deletes the group again. If that delete
/// fails too the error is a `Rollback` naming the group.
pub async fn create_group(
    control_plane: &dyn ControlPlane,
    region: &str,
    name: &str,
    cluster_coordinator: bool,
) -> Result<SecurityGroupRef> {
    info!(region, name, "creating security group");
    let group_id = control_plane
        .create_security_group(region, name)
        .await
        .map_err(|source| Error::remote(Action::CreateSecurityGroup, source))?;

    for rule in required_rules(cluster_coordinator) {
        if let Err(source) = control_plane
            .authorize_security_group(region, &group_id, &rule)
            .await
        {
            warn!(%group_id, port_range = %rule.port_range, error = %source, "authorization failed, deleting group");
            let cause = Error::remote(Action::AuthorizeSecurityGroup, source);
            return Err(match control_plane.delete_security_group(region, &group_id).await {
                Ok(()) => cause,
                Err(delete_err) => {
                    error!(%group_id, error = %delete_err, "could not delete half-authorized security group");
                    Error::Rollback {
                        resource: Resource::SecurityGroup,
                        id: group_id,
                        severity: Severity::Fatal,
                        cause: Some(Box::new(cause)),
                        source: Box::new(Error::remote(Action::DeleteSecurityGroup, delete_err)),
                    }
                }
            });
        }
    }

    info!(%group_id, "security group ready");
    Ok(SecurityGroupRef::ephemeral(group_id))
}

/// Delete a group this driver created. Caller-supplied groups are left alone.
pub async fn delete_group(
    control_plane: &dyn ControlPlane,
    region: &str,
    group: &SecurityGroupRef,
) -> Result<()> {
    if !group.ephemeral {
        info!(group_id = %group.id, "keeping caller-supplied security group");
        return Ok(());
    }
    control_plane
        .delete_security_group(region, &group.id)
        .await
        .map_err(|source| Error::remote(Action::DeleteSecurityGroup, source))?;
    info!(group_id = %group.id, "security group deleted");
    Ok(())
}
