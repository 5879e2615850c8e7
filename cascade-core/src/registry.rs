//! Node registry.
//!
//! A registry is the catalog of node definitions, shared by every
//! [`Engine`](crate::Engine) built on it. Keys are unique within a registry.
//!
//! # Configuration
//!
//! [`RegistryConfig`] controls what happens when a key is registered twice.
//! It derives serde traits so a host can embed it in its own config file:
//!
//! ```rust,ignore
//! let config: RegistryConfig = serde_json::from_str(r#"{ "duplicate_keys": "replace" }"#)?;
//! let registry = Registry::with_config(config);
//! ```

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::handle::{Access, Handle, Key};
use crate::node::Node;

/// What to do when a key is registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeyPolicy {
    /// Fail with [`StateError::DuplicateKey`].
    #[default]
    Reject,
    /// Keep the newer definition and log a warning.
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub duplicate_keys: DuplicateKeyPolicy,
}

pub struct Registry {
    config: RegistryConfig,
    nodes: DashMap<Key, Arc<dyn Node>>,
}

fn access_of(node: &dyn Node) -> Access {
    if node.is_writable() {
        Access::ReadWrite
    } else {
        Access::ReadOnly
    }
}

impl Registry {
    /// Create a registry with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with the given configuration.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
        }
    }

    /// Get the registry's configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Add a node and return a handle to it.
    pub fn register<T>(&self, node: Arc<dyn Node>) -> Result<Handle<T>, StateError> {
        let key = node.key().clone();
        let access = access_of(&*node);

        match self.nodes.entry(key.clone()) {
            Entry::Occupied(mut entry) => match self.config.duplicate_keys {
                DuplicateKeyPolicy::Reject => return Err(StateError::DuplicateKey { key }),
                DuplicateKeyPolicy::Replace => {
                    tracing::warn!(key = %key, "duplicate node key, replacing the earlier definition");
                    entry.insert(node);
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(node);
            }
        }

        tracing::debug!(key = %key, ?access, "registered node");
        Ok(Handle::new(key, access))
    }

    /// Return the handle for `key`, registering `make(key)` first if absent.
    ///
    /// Used by families, which build the same parameterized node on demand.
    pub fn get_or_register<T, F>(&self, key: Key, make: F) -> Handle<T>
    where
        F: FnOnce(Key) -> Arc<dyn Node>,
    {
        if let Some(node) = self.node_maybe(&key) {
            return Handle::new(key, access_of(&*node));
        }

        let node = make(key.clone());
        let access = match self.nodes.entry(key.clone()) {
            Entry::Occupied(entry) => access_of(&**entry.get()),
            Entry::Vacant(entry) => {
                let access = access_of(&*node);
                entry.insert(node);
                tracing::debug!(key = %key, ?access, "registered family member");
                access
            }
        };
        Handle::new(key, access)
    }

    /// Get the node registered under `key`.
    pub fn node(&self, key: &Key) -> Result<Arc<dyn Node>, StateError> {
        self.node_maybe(key)
            .ok_or_else(|| StateError::NodeMissing { key: key.clone() })
    }

    /// Get the node under `key`, if any.
    pub fn node_maybe(&self, key: &Key) -> Option<Arc<dyn Node>> {
        self.nodes.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a node is registered under `key`.
    pub fn contains(&self, key: &Key) -> bool {
        self.nodes.contains_key(key)
    }

    /// Get the number of registered nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no nodes are registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
