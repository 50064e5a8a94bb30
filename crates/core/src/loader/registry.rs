//! Name → destination table populated by layer constructors.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::parameter::ParameterLoader;

/// Join a dotted prefix and a local name.
pub fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Every loadable destination of a model, keyed by its full dotted name.
#[derive(Default)]
pub struct ParameterRegistry {
    params: BTreeMap<String, Arc<dyn ParameterLoader>>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination. Registering the same name twice is a bug in the
    /// caller's module tree.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        param: Arc<dyn ParameterLoader>,
    ) -> Result<()> {
        let name = name.into();
        if self.params.contains_key(&name) {
            return Err(Error::config(format!("parameter '{name}' registered twice")));
        }
        self.params.insert(name, param);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ParameterLoader>> {
        self.params.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Names of destinations with at least one slot never written.
    pub fn unloaded(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(_, p)| !p.is_loaded())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl std::fmt::Debug for ParameterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterRegistry")
            .field("params", &self.params.keys().collect::<Vec<_>>())
            .finish()
    }
}
