//! Name-keyed set of job definitions known to this process.
//!
//! Built before daemons start and read-only afterwards; share it as
//! `Arc<JobRegistry>`.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::definition::{DefinitionError, JobDefinition};

#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: BTreeMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, definition: JobDefinition) -> Result<Arc<JobDefinition>, DefinitionError> {
        definition.policy().validate()?;
        let definition = Arc::new(definition);
        if self
            .definitions
            .insert(definition.name().to_string(), definition.clone())
            .is_some()
        {
            tracing::warn!(job_definition = %definition.name(), "job definition re-registered");
        }
        Ok(definition)
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.definitions.get(name).cloned()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Arc<JobDefinition>> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::JobPolicy;

    fn noop(name: &str) -> JobDefinition {
        JobDefinition::new(JobPolicy::new(name), |_| async { Ok(()) })
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = JobRegistry::new();
        registry.register(noop("a")).unwrap();
        registry.register(noop("b")).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn same_name_replaces() {
        let mut registry = JobRegistry::new();
        registry.register(noop("a")).unwrap();
        registry
            .register(JobDefinition::new(
                JobPolicy::new("a").with_channel("other"),
                |_| async { Ok(()) },
            ))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().channel(), "other");
    }

    #[test]
    fn rejects_invalid_policy() {
        let mut registry = JobRegistry::new();
        assert!(registry.register(noop("")).is_err());
        assert!(registry.is_empty());
    }
}
