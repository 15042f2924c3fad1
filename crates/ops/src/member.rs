//! Fleet members as read from `vm` records, and their login credentials.

use nimbus_core::{Error, NimbusResult, ResourceKind, ResourceRecord};
use nimbus_registry::Registry;
use serde::{Deserialize, Serialize};

/// Record field holding the monitoring agent state of a VM.
pub const MON_AGENT_STATUS: &str = "monAgentStatus";
/// Record field naming the group a VM belongs to.
pub const GROUP_ID: &str = "groupId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetMember {
    pub id: String,
    pub group_id: String,
    pub public_ip: String,
    pub ssh_port: String,
    pub ssh_key_id: String,
    pub user_name: String,
    pub provider_name: String,
    pub mon_agent_status: String,
}

impl FleetMember {
    pub fn from_record(rec: &ResourceRecord) -> Self {
        let s = |f: &str| rec.str_attr(f).unwrap_or_default();
        Self {
            id: rec.id.clone(),
            group_id: s(GROUP_ID),
            public_ip: s("publicIp"),
            ssh_port: s("sshPort"),
            ssh_key_id: s("sshKeyId"),
            user_name: s("userName"),
            provider_name: s("providerName"),
            mon_agent_status: s(MON_AGENT_STATUS),
        }
    }
}

/// Every `vm` record of the namespace whose `groupId` is `group`, id-ascending.
pub async fn working_set(registry: &Registry, namespace: &str, group: &str) -> NimbusResult<Vec<FleetMember>> {
    let vms = registry.list(namespace, ResourceKind::Vm).await?;
    let members: Vec<FleetMember> = vms
        .iter()
        .map(FleetMember::from_record)
        .filter(|m| m.group_id == group)
        .collect();
    if members.is_empty() {
        return Err(Error::invalid(format!("group '{}' in namespace '{}' has no members", group, namespace)));
    }
    Ok(members)
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_name: String,
    pub private_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("user_name", &self.user_name).field("private_key", &"[REDACTED]").finish()
    }
}

/// Resolve the login for `member` from its `sshKey` record. A non-empty
/// `given_user` wins over the user stored on the key or the VM.
pub async fn resolve_credentials(
    registry: &Registry,
    namespace: &str,
    member: &FleetMember,
    given_user: &str,
) -> NimbusResult<Credentials> {
    if member.ssh_key_id.is_empty() {
        return Err(Error::invalid(format!("vm {} has no sshKeyId", member.id)));
    }
    let key = registry.get(namespace, ResourceKind::SshKey, &member.ssh_key_id).await?;
    let private_key = key.str_attr("privateKey").unwrap_or_default();
    if private_key.is_empty() {
        return Err(Error::invalid(format!("sshKey {} has an empty privateKey", member.ssh_key_id)));
    }
    let user_name = [given_user.to_string(), key.str_attr("username").unwrap_or_default(), member.user_name.clone()]
        .into_iter()
        .find(|u| !u.is_empty())
        .ok_or_else(|| Error::invalid(format!("no user name known for vm {}", member.id)))?;
    Ok(Credentials { user_name, private_key })
}
