//! Step processor registry: two-level dispatch with stable priority order.
//!
//! Processors declare kind tags and a priority (lower wins); ties break by
//! insertion order. The registry is mutated only before a query begins; the
//! engine freezes it behind an `Arc` for the duration of evaluation.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::processors::StepProcessor;
use crate::error::{DrWebError, DrWebResult};
use crate::query::Step;

struct Entry {
    processor: Arc<dyn StepProcessor>,
    insertion: usize,
}

#[derive(Default)]
pub struct ProcessorRegistry {
    entries: Vec<Entry>,
    /// Kind tag to entry indices, sorted by (priority, insertion).
    by_kind: HashMap<String, Vec<usize>>,
    next_insertion: usize,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the core processor set.
    pub fn with_core_processors() -> Self {
        use crate::engine::processors::{
            conditional::ConditionalStepProcessor, extract::ExtractStepProcessor,
            follow::FollowStepProcessor, script::ScriptStepProcessor,
        };
        let mut registry = Self::new();
        let core: [Arc<dyn StepProcessor>; 4] = [
            Arc::new(ExtractStepProcessor),
            Arc::new(ConditionalStepProcessor),
            Arc::new(FollowStepProcessor),
            Arc::new(ScriptStepProcessor),
        ];
        for processor in core {
            if let Err(e) = registry.register(processor) {
                unreachable!("core processor registration failed: {e}");
            }
        }
        registry
    }

    /// Register a processor. Rejects an empty kind set and duplicate
    /// `(kind, priority)` pairs; use [`Self::register_replacing`] to replace.
    pub fn register(&mut self, processor: Arc<dyn StepProcessor>) -> DrWebResult<()> {
        self.register_inner(processor, false)
    }

    /// Register, replacing any processor that collides on `(kind, priority)`.
    pub fn register_replacing(&mut self, processor: Arc<dyn StepProcessor>) -> DrWebResult<()> {
        self.register_inner(processor, true)
    }

    fn register_inner(
        &mut self,
        processor: Arc<dyn StepProcessor>,
        replace: bool,
    ) -> DrWebResult<()> {
        if processor.kinds().is_empty() {
            return Err(DrWebError::EmptyKinds { processor: processor.name().to_string() });
        }

        for kind in processor.kinds() {
            let collision = self.entries.iter().position(|e| {
                e.processor.kinds().contains(kind)
                    && e.processor.priority() == processor.priority()
            });
            if let Some(index) = collision {
                if replace {
                    let removed = self.entries.remove(index);
                    info!(
                        "replacing processor `{}` for kind `{kind}`",
                        removed.processor.name()
                    );
                } else {
                    return Err(DrWebError::DuplicateProcessor {
                        kind: kind.to_string(),
                        priority: processor.priority(),
                    });
                }
            }
        }

        info!(
            "registered processor `{}` (kinds: {:?}, priority: {})",
            processor.name(),
            processor.kinds(),
            processor.priority()
        );
        self.entries.push(Entry { processor, insertion: self.next_insertion });
        self.next_insertion += 1;
        self.rebuild_index();
        Ok(())
    }

    /// Remove a processor by name. Idempotent.
    pub fn unregister(&mut self, name: &str) {
        let before = self.entries.len();
        self.entries.retain(|e| e.processor.name() != name);
        if self.entries.len() == before {
            warn!("unregister: no processor named `{name}`");
        } else {
            info!("unregistered processor `{name}`");
            self.rebuild_index();
        }
    }

    fn rebuild_index(&mut self) {
        self.by_kind.clear();
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| (self.entries[i].processor.priority(), self.entries[i].insertion));
        for &i in &order {
            for kind in self.entries[i].processor.kinds() {
                self.by_kind.entry(kind.to_string()).or_default().push(i);
            }
        }
    }

    /// Highest-priority processor whose `can_handle` accepts the step.
    pub fn find_processor(&self, step: &Step) -> Option<Arc<dyn StepProcessor>> {
        if let Some(indices) = self.by_kind.get(step.kind()) {
            for &i in indices {
                if self.entries[i].processor.can_handle(step) {
                    return Some(self.entries[i].processor.clone());
                }
            }
        }

        // fallback scan for processors with can_handle logic beyond kind tags
        let mut order: Vec<&Entry> = self.entries.iter().collect();
        order.sort_by_key(|e| (e.processor.priority(), e.insertion));
        for entry in order {
            if entry.processor.can_handle(step) {
                debug!(
                    "step kind `{}` matched `{}` via fallback scan",
                    step.kind(),
                    entry.processor.name()
                );
                return Some(entry.processor.clone());
            }
        }
        None
    }

    pub fn processor_names(&self) -> Vec<&'static str> {
        let mut order: Vec<&Entry> = self.entries.iter().collect();
        order.sort_by_key(|e| (e.processor.priority(), e.insertion));
        order.iter().map(|e| e.processor.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::{Evaluation, Scope};
    use async_trait::async_trait;
    use serde_json::Value;

    struct StubProcessor {
        name: &'static str,
        kinds: &'static [&'static str],
        priority: i32,
    }

    #[async_trait]
    impl StepProcessor for StubProcessor {
        fn name(&self) -> &'static str {
            self.name
        }
        fn kinds(&self) -> &'static [&'static str] {
            self.kinds
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn can_handle(&self, step: &Step) -> bool {
            self.kinds.contains(&step.kind())
        }
        async fn execute(
            &self,
            _ev: &mut Evaluation<'_>,
            _scope: &Scope,
            _step: &Step,
        ) -> crate::error::DrWebResult<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    fn extension_step(kind: &str) -> Step {
        Step::Extension(crate::query::ExtensionStep {
            kind: kind.to_string(),
            payload: Value::Null,
        })
    }

    #[test]
    fn test_core_registry_dispatches_all_kinds() {
        let registry = ProcessorRegistry::with_core_processors();
        assert_eq!(registry.len(), 4);
        for kind in ["extract", "conditional", "follow", "script"] {
            assert!(registry.by_kind.contains_key(kind), "missing kind {kind}");
        }
    }

    #[test]
    fn test_priority_wins_over_insertion() {
        let mut registry = ProcessorRegistry::new();
        registry
            .register(Arc::new(StubProcessor { name: "late", kinds: &["api"], priority: 100 }))
            .unwrap();
        registry
            .register(Arc::new(StubProcessor { name: "early", kinds: &["api"], priority: 10 }))
            .unwrap();

        let chosen = registry.find_processor(&extension_step("api")).unwrap();
        assert_eq!(chosen.name(), "early");
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut registry = ProcessorRegistry::new();
        registry
            .register(Arc::new(StubProcessor { name: "first", kinds: &["api"], priority: 50 }))
            .unwrap();
        // same kind, same priority: rejected without explicit replacement
        assert!(matches!(
            registry.register(Arc::new(StubProcessor {
                name: "second",
                kinds: &["api"],
                priority: 50
            })),
            Err(DrWebError::DuplicateProcessor { .. })
        ));

        registry
            .register_replacing(Arc::new(StubProcessor {
                name: "second",
                kinds: &["api"],
                priority: 50,
            }))
            .unwrap();
        let chosen = registry.find_processor(&extension_step("api")).unwrap();
        assert_eq!(chosen.name(), "second");
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = ProcessorRegistry::new();
        registry
            .register(Arc::new(StubProcessor { name: "one", kinds: &["api"], priority: 50 }))
            .unwrap();
        registry.unregister("one");
        registry.unregister("one");
        assert!(registry.is_empty());
        assert!(registry.find_processor(&extension_step("api")).is_none());
    }

    #[test]
    fn test_rejects_empty_kind_set() {
        let mut registry = ProcessorRegistry::new();
        assert!(matches!(
            registry.register(Arc::new(StubProcessor { name: "none", kinds: &[], priority: 1 })),
            Err(DrWebError::EmptyKinds { .. })
        ));
    }
}
