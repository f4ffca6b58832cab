//! Warm key derivation from delegated authorization grants.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::constants::WARM_KEY_REQUIRED_PERMISSIONS;
use crate::types::WarmKey;

/// Authorization payload of a grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Fully qualified message type, e.g. `/inference.inference.MsgStartInference`.
    #[serde(default)]
    pub msg: String,
}

/// One authz grant issued by a participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    /// Grantee address.
    #[serde(default)]
    pub grantee: String,
    /// Authorization details.
    #[serde(default)]
    pub authorization: Authorization,
    /// Expiration timestamp.
    #[serde(default)]
    pub expiration: Option<String>,
}

impl Grant {
    /// Short message type: the last `.`-separated segment of the authorization.
    pub fn msg_type(&self) -> &str {
        self.authorization
            .msg
            .rsplit('.')
            .next()
            .unwrap_or_default()
    }
}

/// Derive warm keys: grantees authorized for every required message type.
///
/// `granted_at` is the first expiration seen for the grantee. Output is sorted
/// by `granted_at` descending, ties by address.
pub fn derive_warm_keys(grants: &[Grant]) -> Vec<WarmKey> {
    let required: HashSet<&str> = WARM_KEY_REQUIRED_PERMISSIONS.iter().copied().collect();

    let mut by_grantee: BTreeMap<&str, (String, HashSet<&str>)> = BTreeMap::new();
    for grant in grants {
        if grant.grantee.is_empty() {
            continue;
        }
        let entry = by_grantee
            .entry(grant.grantee.as_str())
            .or_insert_with(|| (grant.expiration.clone().unwrap_or_default(), HashSet::new()));
        let msg_type = grant.msg_type();
        if required.contains(msg_type) {
            entry.1.insert(msg_type);
        }
    }

    let mut keys: Vec<WarmKey> = by_grantee
        .into_iter()
        .filter(|(_, (_, perms))| perms.len() == required.len())
        .map(|(grantee, (granted_at, _))| WarmKey {
            grantee_address: grantee.to_string(),
            granted_at,
        })
        .collect();

    keys.sort_by(|a, b| {
        b.granted_at
            .cmp(&a.granted_at)
            .then_with(|| a.grantee_address.cmp(&b.grantee_address))
    });
    keys
}
