//! Routing Module
//!
//! Decides which nodes receive each captured change and packs the routed
//! events into per-target outgoing batches.

mod batcher;
mod column;
mod lookup;
mod service;
mod subset;

pub use batcher::OutgoingBatcher;
pub use column::{ColumnMatchRouter, MatchClause, MatchOperator};
pub use lookup::{LookupExpression, LookupTableRouter};
pub use service::{RouterService, SubscriptionSource};
pub use subset::SubsetRouter;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::RowEvent;

/// A participating database instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    pub id: String,
    pub group_id: String,
    pub external_id: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }
}

/// Built-in or plugged-in routing strategy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouterType {
    /// Every node of the target group
    Default,
    Column,
    LookupTable,
    Subset,
    /// Resolved by name in the extension registry
    Custom(String),
}

impl FromStr for RouterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        Ok(match name.to_ascii_lowercase().as_str() {
            "" => return Err(Error::Config("router type must not be empty".into())),
            "default" => RouterType::Default,
            "column" => RouterType::Column,
            "lookuptable" | "lookup_table" | "lookup" => RouterType::LookupTable,
            "subset" => RouterType::Subset,
            _ => RouterType::Custom(name.to_string()),
        })
    }
}

impl fmt::Display for RouterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterType::Default => f.write_str("default"),
            RouterType::Column => f.write_str("column"),
            RouterType::LookupTable => f.write_str("lookuptable"),
            RouterType::Subset => f.write_str("subset"),
            RouterType::Custom(name) => f.write_str(name),
        }
    }
}

/// A routing rule from a source group to a target group on one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub source_group_id: String,
    pub target_group_id: String,
    pub channel_id: String,
    pub router_type: RouterType,
    /// Interpreted by the router type
    pub router_expression: String,
    /// Lower runs first
    pub priority: i32,
    /// Table name, or `*` for every table
    pub table: String,
    pub enabled: bool,
}

impl Subscription {
    pub fn new(
        id: impl Into<String>,
        source_group_id: impl Into<String>,
        target_group_id: impl Into<String>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_group_id: source_group_id.into(),
            target_group_id: target_group_id.into(),
            channel_id: channel_id.into(),
            router_type: RouterType::Default,
            router_expression: String::new(),
            priority: 0,
            table: "*".into(),
            enabled: true,
        }
    }

    pub fn with_router(mut self, router_type: RouterType, expression: impl Into<String>) -> Self {
        self.router_type = router_type;
        self.router_expression = expression.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Whether this rule covers `event`'s table
    pub fn matches_table(&self, event: &RowEvent) -> bool {
        let table = self.table.trim();
        table == "*"
            || table.eq_ignore_ascii_case(&event.table.name)
            || table.eq_ignore_ascii_case(&event.table.qualified_name())
    }
}

/// What a router sees besides the event
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub source_node: &'a Node,
    pub subscription: &'a Subscription,
}

/// A router type: picks target nodes among the candidates
#[async_trait]
pub trait DataRouter: Send + Sync {
    async fn route(
        &self,
        context: &RouteContext<'_>,
        event: &RowEvent,
        candidates: &[Node],
    ) -> Result<BTreeSet<String>>;

    /// Drop anything cached from configuration or lookups
    async fn invalidate(&self) {}
}

/// Routes to every candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRouter;

#[async_trait]
impl DataRouter for DefaultRouter {
    async fn route(
        &self,
        _context: &RouteContext<'_>,
        _event: &RowEvent,
        candidates: &[Node],
    ) -> Result<BTreeSet<String>> {
        Ok(candidates.iter().map(|n| n.id.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableIdentity;

    #[test]
    fn test_router_type_parsing() {
        assert_eq!("column".parse::<RouterType>().unwrap(), RouterType::Column);
        assert_eq!("LookupTable".parse::<RouterType>().unwrap(), RouterType::LookupTable);
        assert_eq!(
            "audit".parse::<RouterType>().unwrap(),
            RouterType::Custom("audit".into())
        );
        assert!(" ".parse::<RouterType>().is_err());
        assert_eq!(RouterType::Subset.to_string(), "subset");
    }

    #[test]
    fn test_subscription_table_filter() {
        let event = RowEvent::delete(
            TableIdentity::with_schema("app", "Item"),
            vec!["id".into()],
            vec![Some("1".into())],
        );
        let sub = Subscription::new("s", "corp", "store", "item");
        assert!(sub.matches_table(&event));
        assert!(sub.clone().for_table("item").matches_table(&event));
        assert!(sub.clone().for_table("app.item").matches_table(&event));
        assert!(!sub.for_table("sale").matches_table(&event));
    }
}
