//! Channel registry: provisioned channel instances, looked up by name or id.
//!
//! Built once at start from config and never mutated afterwards.

use crate::config::ChannelInstanceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Tenant-level grouping of instances sharing one gateway URL and credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelGroup {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// One messaging-gateway connection (one sender identity).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInstance {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub group: ChannelGroup,
}

impl From<&ChannelInstanceConfig> for ChannelInstance {
    fn from(c: &ChannelInstanceConfig) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            status: c.status.clone(),
            group: ChannelGroup {
                name: c.group.name.clone(),
                url: c.group.url.clone(),
                api_key: c.group.api_key.clone(),
                owner: c.group.owner.clone(),
            },
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelRegistryError {
    #[error("duplicate channel instance name: {0}")]
    DuplicateName(String),
    #[error("duplicate channel instance id: {0}")]
    DuplicateId(i64),
}

/// Read-only registry of channel instances.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    by_name: HashMap<String, ChannelInstance>,
    name_by_id: HashMap<i64, String>,
}

impl ChannelRegistry {
    pub fn new(instances: Vec<ChannelInstance>) -> Result<Self, ChannelRegistryError> {
        let mut registry = Self::default();
        for instance in instances {
            if registry.by_name.contains_key(&instance.name) {
                return Err(ChannelRegistryError::DuplicateName(instance.name));
            }
            if registry.name_by_id.contains_key(&instance.id) {
                return Err(ChannelRegistryError::DuplicateId(instance.id));
            }
            registry.name_by_id.insert(instance.id, instance.name.clone());
            registry.by_name.insert(instance.name.clone(), instance);
        }
        Ok(registry)
    }

    pub fn from_config(instances: &[ChannelInstanceConfig]) -> Result<Self, ChannelRegistryError> {
        Self::new(instances.iter().map(ChannelInstance::from).collect())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ChannelInstance> {
        self.by_name.get(name)
    }

    pub fn find_by_id(&self, id: i64) -> Option<&ChannelInstance> {
        self.name_by_id.get(&id).and_then(|n| self.by_name.get(n))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: i64, name: &str) -> ChannelInstance {
        ChannelInstance {
            id,
            name: name.to_string(),
            status: "open".to_string(),
            group: ChannelGroup {
                name: "acme".to_string(),
                url: "http://gw".to_string(),
                api_key: None,
                owner: None,
            },
        }
    }

    #[test]
    fn lookup_by_name_and_id() {
        let registry = ChannelRegistry::new(vec![instance(1, "sales"), instance(2, "support")]).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_by_name("support").map(|i| i.id), Some(2));
        assert_eq!(registry.find_by_id(1).map(|i| i.name.as_str()), Some("sales"));
        assert!(registry.find_by_name("unknown").is_none());
        assert!(registry.find_by_id(9).is_none());
    }

    #[test]
    fn duplicates_are_rejected() {
        let err = ChannelRegistry::new(vec![instance(1, "sales"), instance(2, "sales")]).unwrap_err();
        assert_eq!(err, ChannelRegistryError::DuplicateName("sales".to_string()));
        let err = ChannelRegistry::new(vec![instance(1, "sales"), instance(1, "support")]).unwrap_err();
        assert_eq!(err, ChannelRegistryError::DuplicateId(1));
    }
}
