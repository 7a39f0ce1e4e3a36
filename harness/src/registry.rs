//! Maps discovered catalog entries to their compiled implementations.

use std::collections::HashMap;
use std::sync::Arc;

use crate::traits::TestCase;
use crate::units;

/// Registry of compiled test cases, keyed by their catalog file name.
#[derive(Default)]
pub struct Registry {
    cases: HashMap<String, Arc<dyn TestCase>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All test cases shipped with the harness.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(units::cpu::BasicRead));
        registry.register(Arc::new(units::cpu::NestedDelete));
        registry.register(Arc::new(units::cpuset::ExclusiveRead));
        registry.register(Arc::new(units::cpu::ClassifyWorkload));
        registry.register(Arc::new(units::cpu::ThreadedMembership));
        registry
    }

    pub fn register(&mut self, case: Arc<dyn TestCase>) {
        self.cases.insert(case.file().to_string(), case);
    }

    pub fn lookup(&self, file: &str) -> Option<Arc<dyn TestCase>> {
        self.cases.get(file).cloned()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_catalog_names() {
        let registry = Registry::builtin();
        assert_eq!(registry.len(), 5);
        assert!(registry.lookup("001-cpu-basic_read").is_some());
        assert!(registry.lookup("036-cpu-threaded_membership").is_some());
        assert!(registry.lookup("999-cpu-missing").is_none());
    }
}
