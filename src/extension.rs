//! Extension Points
//!
//! Narrow interfaces the surrounding system plugs behavior into: write
//! filters, table-missing handlers, a conflict resolver, an error handler
//! chain and named router types. The registry is built once at startup
//! and only read afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{BatchHeader, RowEvent, TableIdentity};
use crate::platform::{Platform, PlatformTransaction};
use crate::route::DataRouter;

/// Where in a batch an extension is being called
#[derive(Debug, Clone, Copy)]
pub struct WriteContext<'a> {
    pub header: &'a BatchHeader,
    /// 1-based position of the event within the batch
    pub event_index: u64,
}

/// Outcome of a before-write filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Continue,
    Skip,
}

/// Sees every event before and after it is applied
pub trait WriteFilter: Send + Sync {
    fn name(&self) -> &str;

    /// May rewrite the event in place, or veto it
    fn before_write(&self, _context: &WriteContext<'_>, _event: &mut RowEvent) -> Result<FilterAction> {
        Ok(FilterAction::Continue)
    }

    fn after_write(&self, _context: &WriteContext<'_>, _event: &RowEvent) -> Result<()> {
        Ok(())
    }
}

/// What a table-missing handler did about an absent target table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableMissingAction {
    /// The table now exists; retry the lookup
    Created,
    /// Apply the event to another table instead
    Remap(TableIdentity),
    /// Drop the event
    Skip,
    /// Not this handler's table
    Unhandled,
}

#[async_trait]
pub trait TableMissingHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        platform: &dyn Platform,
        transaction: &mut dyn PlatformTransaction,
        event: &RowEvent,
    ) -> Result<TableMissingAction>;
}

/// Kind of mismatch between an event and the target row state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// INSERT hit an existing key
    InsertCollision,
    /// UPDATE matched no row
    UpdateMissing,
    /// DELETE matched no row
    DeleteMissing,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictKind::InsertCollision => "insert collision",
            ConflictKind::UpdateMissing => "update of missing row",
            ConflictKind::DeleteMissing => "delete of missing row",
        };
        f.write_str(name)
    }
}

/// Resolver decision for a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Try the alternate statement once (insert collision -> update, update miss -> insert)
    Fallback,
    Ignore,
    Fail,
}

pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, kind: ConflictKind, event: &RowEvent) -> Resolution;
}

/// Falls back on row conflicts and ignores deletes of missing rows
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConflictResolver;

impl ConflictResolver for DefaultConflictResolver {
    fn name(&self) -> &str {
        "default"
    }

    fn resolve(&self, kind: ConflictKind, _event: &RowEvent) -> Resolution {
        match kind {
            ConflictKind::InsertCollision | ConflictKind::UpdateMissing => Resolution::Fallback,
            ConflictKind::DeleteMissing => Resolution::Ignore,
        }
    }
}

/// Link of the writer's error handler chain
pub trait ErrorHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Return true when the error is handled and the batch may continue
    fn handle(&self, context: &WriteContext<'_>, event: &RowEvent, error: &Error) -> bool;
}

/// Registered extensions, shared read-only by the pipeline components
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    filters: Vec<Arc<dyn WriteFilter>>,
    table_missing: Vec<Arc<dyn TableMissingHandler>>,
    conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    error_handlers: Vec<Arc<dyn ErrorHandler>>,
    routers: HashMap<String, Arc<dyn DataRouter>>,
}

impl ExtensionRegistry {
    pub fn builder() -> ExtensionRegistryBuilder {
        ExtensionRegistryBuilder::default()
    }

    pub fn filters(&self) -> &[Arc<dyn WriteFilter>] {
        &self.filters
    }

    pub fn table_missing_handlers(&self) -> &[Arc<dyn TableMissingHandler>] {
        &self.table_missing
    }

    /// The registered resolver, or the default one
    pub fn conflict_resolver(&self) -> Arc<dyn ConflictResolver> {
        self.conflict_resolver
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultConflictResolver))
    }

    pub fn error_handlers(&self) -> &[Arc<dyn ErrorHandler>] {
        &self.error_handlers
    }

    /// Custom router type by name
    pub fn router(&self, name: &str) -> Option<Arc<dyn DataRouter>> {
        self.routers.get(name).cloned()
    }

    pub fn router_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("filters", &self.filters.iter().map(|x| x.name().to_string()).collect::<Vec<_>>())
            .field(
                "table_missing",
                &self.table_missing.iter().map(|x| x.name().to_string()).collect::<Vec<_>>(),
            )
            .field("conflict_resolver", &self.conflict_resolver.as_ref().map(|r| r.name().to_string()))
            .field(
                "error_handlers",
                &self.error_handlers.iter().map(|x| x.name().to_string()).collect::<Vec<_>>(),
            )
            .field("routers", &self.router_names())
            .finish()
    }
}

#[derive(Default)]
pub struct ExtensionRegistryBuilder {
    registry: ExtensionRegistry,
}

impl ExtensionRegistryBuilder {
    /// Filters run in registration order
    pub fn filter(mut self, filter: impl WriteFilter + 'static) -> Self {
        self.registry.filters.push(Arc::new(filter));
        self
    }

    pub fn table_missing_handler(mut self, handler: impl TableMissingHandler + 'static) -> Self {
        self.registry.table_missing.push(Arc::new(handler));
        self
    }

    pub fn conflict_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.registry.conflict_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.registry.error_handlers.push(Arc::new(handler));
        self
    }

    /// Register a router type under `name`; a later registration replaces an earlier one
    pub fn router(mut self, name: impl Into<String>, router: impl DataRouter + 'static) -> Self {
        let name = name.into();
        if self.registry.routers.insert(name.clone(), Arc::new(router)).is_some() {
            tracing::warn!("Router type '{}' registered twice, keeping the last", name);
        }
        self
    }

    pub fn build(self) -> Arc<ExtensionRegistry> {
        Arc::new(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableIdentity;

    struct Redact;

    impl WriteFilter for Redact {
        fn name(&self) -> &str {
            "redact"
        }

        fn before_write(&self, _context: &WriteContext<'_>, event: &mut RowEvent) -> Result<FilterAction> {
            if let Some(i) = event.column_names.iter().position(|c| c == "secret") {
                event.row_data[i] = None;
            }
            Ok(FilterAction::Continue)
        }
    }

    struct IgnoreAll;

    impl ConflictResolver for IgnoreAll {
        fn name(&self) -> &str {
            "ignore-all"
        }

        fn resolve(&self, _kind: ConflictKind, _event: &RowEvent) -> Resolution {
            Resolution::Ignore
        }
    }

    fn event() -> RowEvent {
        RowEvent::insert(
            TableIdentity::new("t"),
            vec!["id".into(), "secret".into()],
            vec!["id".into()],
            vec![Some("1".into()), Some("hunter2".into())],
        )
    }

    #[test]
    fn test_empty_registry_uses_default_resolver() {
        let registry = ExtensionRegistry::default();
        let resolver = registry.conflict_resolver();
        assert_eq!(resolver.name(), "default");
        assert_eq!(
            resolver.resolve(ConflictKind::UpdateMissing, &event()),
            Resolution::Fallback
        );
        assert_eq!(
            resolver.resolve(ConflictKind::DeleteMissing, &event()),
            Resolution::Ignore
        );
        assert!(registry.filters().is_empty());
        assert!(registry.router("anything").is_none());
    }

    #[test]
    fn test_builder_registers_extensions() {
        let registry = ExtensionRegistry::builder()
            .filter(Redact)
            .conflict_resolver(IgnoreAll)
            .build();

        let header = BatchHeader {
            batch_id: 1,
            source_node_id: "a".into(),
            target_node_id: None,
            channel_id: "default".into(),
            binary_encoding: Default::default(),
            initial_load: false,
            ignored: false,
        };
        let context = WriteContext {
            header: &header,
            event_index: 1,
        };
        let mut event = event();
        let action = registry.filters()[0].before_write(&context, &mut event).unwrap();
        assert_eq!(action, FilterAction::Continue);
        assert_eq!(event.value("secret"), None);
        assert_eq!(registry.conflict_resolver().name(), "ignore-all");
        assert!(format!("{:?}", registry).contains("redact"));
    }
}
