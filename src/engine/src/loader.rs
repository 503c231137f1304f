//! Policy loader capability and storage events
//!
//! The backing policy store (disk, database, remote bundle) is external.
//! The engine consumes it through [`PolicyLoader`] and reacts to its change
//! notifications through [`StorageEvent`]s. A "not found" lookup is `None`,
//! never an error.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::namer::ModuleId;
use crate::policy::PolicySet;

/// Provides compiled policy sets by module id.
#[async_trait]
pub trait PolicyLoader: Send + Sync {
    /// Returns the first policy set matching any of `ids`, in `ids` order.
    async fn get_first_match(&self, ids: &[ModuleId]) -> Result<Option<Arc<PolicySet>>>;

    /// Returns every policy set matching one of `ids`.
    async fn get_all_matching(&self, ids: &[ModuleId]) -> Result<Vec<Arc<PolicySet>>>;

    /// Returns the full snapshot of compiled policies.
    async fn get_all(&self) -> Result<Vec<Arc<PolicySet>>>;
}

/// Kinds of storage change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The whole store changed; subscribers should rebuild.
    Reload,
    AddOrUpdatePolicy,
    DeleteOrDisablePolicy,
    /// Unknown to this engine version; ignored by subscribers.
    Other,
}

/// A change notification from the policy store.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub kind: EventKind,
    /// Set for add/update/delete events.
    pub policy_id: Option<ModuleId>,
}

impl StorageEvent {
    pub fn reload() -> Self {
        Self {
            kind: EventKind::Reload,
            policy_id: None,
        }
    }

    pub fn add_or_update(id: ModuleId) -> Self {
        Self {
            kind: EventKind::AddOrUpdatePolicy,
            policy_id: Some(id),
        }
    }

    pub fn delete_or_disable(id: ModuleId) -> Self {
        Self {
            kind: EventKind::DeleteOrDisablePolicy,
            policy_id: Some(id),
        }
    }
}

/// A consumer of storage events, registered with the store by name.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable name used for registration and deregistration.
    fn subscriber_id(&self) -> &'static str;

    async fn on_storage_event(&self, events: &[StorageEvent]);
}

/// In-memory policy loader for embedding and tests.
///
/// Policies are indexed by the module id derived from their FQN.
#[derive(Default)]
pub struct MemoryPolicyLoader {
    policies: RwLock<HashMap<ModuleId, Arc<PolicySet>>>,
}

impl MemoryPolicyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a policy set, returning its module id.
    pub async fn put(&self, set: PolicySet) -> ModuleId {
        let id = ModuleId::from_fqn(set.fqn());
        self.policies.write().await.insert(id.clone(), Arc::new(set));
        id
    }

    pub async fn remove(&self, id: &ModuleId) {
        self.policies.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.policies.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.policies.read().await.is_empty()
    }
}

#[async_trait]
impl PolicyLoader for MemoryPolicyLoader {
    async fn get_first_match(&self, ids: &[ModuleId]) -> Result<Option<Arc<PolicySet>>> {
        let policies = self.policies.read().await;
        for id in ids {
            if let Some(set) = policies.get(id) {
                return Ok(Some(set.clone()));
            }
        }
        Ok(None)
    }

    async fn get_all_matching(&self, ids: &[ModuleId]) -> Result<Vec<Arc<PolicySet>>> {
        let policies = self.policies.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| policies.get(id).cloned())
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<Arc<PolicySet>>> {
        let policies = self.policies.read().await;
        Ok(policies.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyMeta, PolicyName, RolePolicySet, ScopePermissions};

    fn role_policy(role: &str, scope: &str) -> PolicySet {
        PolicySet::Role(RolePolicySet {
            meta: PolicyMeta {
                fqn: crate::namer::role_policy_fqn(role, scope),
                name: PolicyName::Role(role.to_string()),
                version: "default".into(),
                source_attributes: Default::default(),
                annotations: Default::default(),
            },
            role: role.to_string(),
            scope: scope.to_string(),
            scope_permissions: ScopePermissions::OverrideParent,
            parent_roles: Vec::new(),
            resources: Default::default(),
        })
    }

    #[tokio::test]
    async fn first_match_respects_id_order() {
        let loader = MemoryPolicyLoader::new();
        loader.put(role_policy("auditor", "")).await;
        loader.put(role_policy("auditor", "acme")).await;

        let ids = vec![
            crate::namer::role_policy_module_id("auditor", "acme.hr"),
            crate::namer::role_policy_module_id("auditor", "acme"),
            crate::namer::role_policy_module_id("auditor", ""),
        ];

        let found = loader.get_first_match(&ids).await.unwrap().unwrap();
        assert_eq!(found.fqn(), "verdict.role.auditor/acme");
    }

    #[tokio::test]
    async fn missing_policy_is_none_not_error() {
        let loader = MemoryPolicyLoader::new();
        let ids = vec![crate::namer::role_policy_module_id("ghost", "")];
        assert!(loader.get_first_match(&ids).await.unwrap().is_none());
        assert!(loader.get_all_matching(&ids).await.unwrap().is_empty());
    }
}
