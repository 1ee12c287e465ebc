//! Operation handlers and their registry.
//!
//! Each operation type is served by exactly one handler. The handler gets the
//! claimed operation with its files and records the outcome on it: file
//! statuses, the operation status, error text.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::Operation;

#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// The `Operation::op_type` this handler serves.
    fn operation_type(&self) -> &str;

    /// Execute one operation. An `Err` fails the operation and its request.
    async fn execute(&self, operation: &mut Operation) -> Result<()>;
}

/// Handlers indexed by operation type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a handler, replacing any previous one for the same type.
    pub fn register(mut self, handler: impl OperationHandler + 'static) -> Self {
        self.handlers
            .insert(handler.operation_type().to_string(), Arc::new(handler));
        self
    }

    /// Look up the handler for an operation type.
    pub fn get(&self, operation_type: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers.get(operation_type).cloned()
    }

    pub fn operation_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationStatus;

    struct Noop(&'static str);

    #[async_trait]
    impl OperationHandler for Noop {
        fn operation_type(&self) -> &str {
            self.0
        }

        async fn execute(&self, operation: &mut Operation) -> Result<()> {
            operation.status = OperationStatus::Done;
            Ok(())
        }
    }

    #[test]
    fn registry_indexes_by_type() {
        assert!(HandlerRegistry::empty().is_empty());
        let registry = HandlerRegistry::empty()
            .register(Noop("RemoveFile"))
            .register(Noop("ReplicateAndRegister"));
        assert!(registry.get("RemoveFile").is_some());
        assert!(registry.get("PutAndRegister").is_none());
        assert_eq!(
            registry.operation_types(),
            vec!["RemoveFile", "ReplicateAndRegister"]
        );
        assert!(!registry.is_empty());
    }
}
