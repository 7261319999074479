//! SOP registry: published definitions keyed by (name, version)
//!
//! Only published definitions enter the registry, and once in they are
//! never replaced. A new revision of a procedure is a new version.

use crate::{EngineError, EngineResult};
use labflow_types::{DefinitionError, SopDefinition, SopKey};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
pub struct SopRegistry {
    definitions: RwLock<BTreeMap<SopKey, Arc<SopDefinition>>>,
}

impl SopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, freeze and register a draft definition.
    pub fn publish(&self, definition: SopDefinition) -> EngineResult<Arc<SopDefinition>> {
        let published = definition.publish()?;
        self.insert(published)
    }

    /// Register a definition that was published elsewhere.
    pub fn register_published(&self, definition: SopDefinition) -> EngineResult<Arc<SopDefinition>> {
        definition.ensure_runnable()?;
        self.insert(definition)
    }

    fn insert(&self, definition: SopDefinition) -> EngineResult<Arc<SopDefinition>> {
        let key = definition.key();
        let mut definitions = self.definitions.write();
        if definitions.contains_key(&key) {
            return Err(DefinitionError::AlreadyPublished(key).into());
        }
        let definition = Arc::new(definition);
        definitions.insert(key.clone(), definition.clone());

        info!(
            sop = %key,
            steps = definition.steps.len(),
            "SOP published"
        );
        Ok(definition)
    }

    pub fn get(&self, key: &SopKey) -> EngineResult<Arc<SopDefinition>> {
        self.definitions
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::SopNotFound(key.clone()))
    }

    /// Highest published version of a procedure.
    pub fn latest(&self, name: &str) -> Option<Arc<SopDefinition>> {
        self.definitions
            .read()
            .range(SopKey::new(name, 0)..=SopKey::new(name, u32::MAX))
            .next_back()
            .map(|(_, def)| def.clone())
    }

    pub fn versions(&self, name: &str) -> Vec<u32> {
        self.definitions
            .read()
            .keys()
            .filter(|key| key.name == name)
            .map(|key| key.version)
            .collect()
    }

    pub fn list(&self) -> Vec<SopKey> {
        self.definitions.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.definitions.read().len()
    }

    /// Load one definition from a JSON file. Drafts are published on load;
    /// already-published definitions are checked and registered as-is.
    pub async fn load_json(&self, path: impl AsRef<Path>) -> EngineResult<Arc<SopDefinition>> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let definition: SopDefinition = serde_json::from_str(&text)?;
        debug!(path = %path.display(), sop = %definition.key(), "Loaded SOP definition");

        if definition.is_published() {
            self.register_published(definition)
        } else {
            self.publish(definition)
        }
    }
}
