//! Router service
//!
//! Evaluates every enabled subscription for an event's channel in a fixed
//! order and unions the targets each router type selects.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{
    ColumnMatchRouter, DataRouter, DefaultRouter, LookupTableRouter, Node, RouteContext,
    RouterType, Subscription, SubsetRouter,
};
use crate::error::{Error, Result};
use crate::extension::ExtensionRegistry;
use crate::model::RowEvent;
use crate::platform::Platform;

/// Where subscriptions come from
pub trait SubscriptionSource: Send + Sync {
    fn load(&self) -> Result<Vec<Subscription>>;
}

impl SubscriptionSource for Vec<Subscription> {
    fn load(&self) -> Result<Vec<Subscription>> {
        Ok(self.clone())
    }
}

/// Routes captured events for one source node
pub struct RouterService {
    source_node: Node,
    nodes: RwLock<Arc<Vec<Node>>>,
    source: Box<dyn SubscriptionSource>,
    subscriptions: RwLock<Option<Arc<Vec<Subscription>>>>,
    extensions: Arc<ExtensionRegistry>,
    column: ColumnMatchRouter,
    lookup: Option<LookupTableRouter>,
}

impl RouterService {
    pub fn new(
        source_node: Node,
        nodes: Vec<Node>,
        source: impl SubscriptionSource + 'static,
        extensions: Arc<ExtensionRegistry>,
    ) -> Self {
        Self {
            source_node,
            nodes: RwLock::new(Arc::new(nodes)),
            source: Box::new(source),
            subscriptions: RwLock::new(None),
            extensions,
            column: ColumnMatchRouter::new(),
            lookup: None,
        }
    }

    /// Enable lookup-table routing against `platform`
    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.lookup = Some(LookupTableRouter::new(platform));
        self
    }

    pub fn source_node(&self) -> &Node {
        &self.source_node
    }

    pub async fn nodes(&self) -> Arc<Vec<Node>> {
        Arc::clone(&*self.nodes.read().await)
    }

    pub async fn set_nodes(&self, nodes: Vec<Node>) {
        *self.nodes.write().await = Arc::new(nodes);
    }

    /// Subscriptions sorted by priority; ties keep registration order
    pub async fn subscriptions(&self) -> Result<Arc<Vec<Subscription>>> {
        if let Some(subs) = self.subscriptions.read().await.as_ref() {
            return Ok(Arc::clone(subs));
        }

        let mut guard = self.subscriptions.write().await;
        if let Some(subs) = guard.as_ref() {
            return Ok(Arc::clone(subs));
        }
        let mut subs = self.source.load()?;
        subs.sort_by_key(|s| s.priority);
        tracing::debug!("Loaded {} subscriptions", subs.len());
        let subs = Arc::new(subs);
        *guard = Some(Arc::clone(&subs));
        Ok(subs)
    }

    /// Drop cached subscriptions and router state
    pub async fn invalidate(&self) {
        *self.subscriptions.write().await = None;
        self.column.invalidate().await;
        if let Some(lookup) = &self.lookup {
            lookup.invalidate().await;
        }
        for name in self.extensions.router_names() {
            if let Some(router) = self.extensions.router(name) {
                router.invalidate().await;
            }
        }
    }

    /// Channels with at least one enabled subscription from this node's group
    pub async fn channels(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .subscriptions()
            .await?
            .iter()
            .filter(|s| s.enabled && s.source_group_id == self.source_node.group_id)
            .map(|s| s.channel_id.clone())
            .collect())
    }

    fn candidates(&self, nodes: &[Node], subscription: &Subscription) -> Vec<Node> {
        nodes
            .iter()
            .filter(|n| n.group_id == subscription.target_group_id && n.id != self.source_node.id)
            .cloned()
            .collect()
    }

    async fn evaluate(
        &self,
        subscription: &Subscription,
        event: &RowEvent,
        candidates: &[Node],
    ) -> Result<BTreeSet<String>> {
        let context = RouteContext {
            source_node: &self.source_node,
            subscription,
        };
        match &subscription.router_type {
            RouterType::Default => DefaultRouter.route(&context, event, candidates).await,
            RouterType::Column => self.column.route(&context, event, candidates).await,
            RouterType::Subset => SubsetRouter.route(&context, event, candidates).await,
            RouterType::LookupTable => match &self.lookup {
                Some(lookup) => lookup.route(&context, event, candidates).await,
                None => Err(Error::Routing(
                    "lookup table routing needs a database platform".into(),
                )),
            },
            RouterType::Custom(name) => match self.extensions.router(name) {
                Some(router) => router.route(&context, event, candidates).await,
                None => Err(Error::Routing(format!("no router registered as '{}'", name))),
            },
        }
    }

    /// Target node ids for one event on `channel_id`
    pub async fn route(&self, channel_id: &str, event: &RowEvent) -> Result<BTreeSet<String>> {
        let subscriptions = self.subscriptions().await?;
        let nodes = self.nodes().await;
        let mut targets = BTreeSet::new();

        for subscription in subscriptions.iter().filter(|s| {
            s.enabled
                && s.source_group_id == self.source_node.group_id
                && s.channel_id == channel_id
                && s.matches_table(event)
        }) {
            let candidates = self.candidates(&nodes, subscription);
            if candidates.is_empty() {
                continue;
            }

            if event.event_type.is_script() {
                targets.extend(candidates.iter().map(|n| n.id.clone()));
                continue;
            }

            match self.evaluate(subscription, event, &candidates).await {
                Ok(selected) => targets.extend(
                    selected
                        .into_iter()
                        .filter(|id| candidates.iter().any(|n| &n.id == id)),
                ),
                Err(e) => {
                    tracing::warn!(
                        "Router '{}' of subscription {} failed on {}: {}",
                        subscription.router_type,
                        subscription.id,
                        event.describe(),
                        e
                    );
                }
            }
        }

        Ok(targets)
    }

    /// Initial-load events go to the requesting node only
    pub fn route_initial_load(&self, target_node_id: &str) -> BTreeSet<String> {
        BTreeSet::from([target_node_id.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableIdentity;
    use async_trait::async_trait;

    fn nodes() -> Vec<Node> {
        vec![
            Node::new("000", "corp"),
            Node::new("100", "store").with_external_id("s1"),
            Node::new("200", "store").with_external_id("s2"),
            Node::new("900", "audit"),
        ]
    }

    fn sale(store: &str) -> RowEvent {
        RowEvent::insert(
            TableIdentity::new("sale"),
            vec!["id".into(), "store_id".into()],
            vec!["id".into()],
            vec![Some("1".into()), Some(store.into())],
        )
    }

    fn service(subs: Vec<Subscription>, extensions: Arc<ExtensionRegistry>) -> RouterService {
        RouterService::new(Node::new("000", "corp"), nodes(), subs, extensions)
    }

    struct Exploding;

    #[async_trait]
    impl DataRouter for Exploding {
        async fn route(
            &self,
            _context: &RouteContext<'_>,
            _event: &RowEvent,
            _candidates: &[Node],
        ) -> Result<BTreeSet<String>> {
            Err(Error::Internal("boom".into()))
        }
    }

    #[tokio::test]
    async fn test_union_across_subscriptions() {
        let subs = vec![
            Subscription::new("stores", "corp", "store", "sale")
                .with_router(RouterType::Column, "STORE_ID=:EXTERNAL_ID"),
            Subscription::new("audit", "corp", "audit", "sale"),
            Subscription::new("other-channel", "corp", "store", "item"),
            Subscription::new("other-group", "store", "corp", "sale"),
        ];
        let service = service(subs, ExtensionRegistry::builder().build());

        let targets = service.route("sale", &sale("s2")).await.unwrap();
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["200", "900"]);
        let channels = service.channels().await.unwrap();
        assert_eq!(channels.into_iter().collect::<Vec<_>>(), vec!["item", "sale"]);
    }

    #[tokio::test]
    async fn test_failing_router_is_isolated() {
        let extensions = ExtensionRegistry::builder().router("exploding", Exploding).build();
        let subs = vec![
            Subscription::new("bad", "corp", "store", "sale")
                .with_router(RouterType::Custom("exploding".into()), ""),
            Subscription::new("missing", "corp", "store", "sale")
                .with_router(RouterType::Custom("nowhere".into()), ""),
            Subscription::new("audit", "corp", "audit", "sale"),
        ];
        let service = service(subs, extensions);

        let targets = service.route("sale", &sale("s1")).await.unwrap();
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["900"]);
    }

    #[tokio::test]
    async fn test_scripts_reach_every_subscribed_node() {
        let subs = vec![Subscription::new("stores", "corp", "store", "sale")
            .with_router(RouterType::Column, "STORE_ID=:EXTERNAL_ID")];
        let service = service(subs, ExtensionRegistry::builder().build());

        let ddl = RowEvent::sql(TableIdentity::new("sale"), "ALTER TABLE sale ADD note TEXT");
        let targets = service.route("sale", &ddl).await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(
            service.route_initial_load("100").into_iter().collect::<Vec<_>>(),
            vec!["100"]
        );
    }

    #[tokio::test]
    async fn test_routing_is_deterministic() {
        let subs = vec![
            Subscription::new("b", "corp", "store", "sale")
                .with_priority(5)
                .with_router(RouterType::Subset, "nodes:200"),
            Subscription::new("a", "corp", "store", "sale")
                .with_priority(1)
                .with_router(RouterType::Column, "STORE_ID=:EXTERNAL_ID"),
        ];
        let service = service(subs, ExtensionRegistry::builder().build());

        let order: Vec<_> = service
            .subscriptions()
            .await
            .unwrap()
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(order, vec!["a", "b"]);

        let first = service.route("sale", &sale("s1")).await.unwrap();
        service.invalidate().await;
        let second = service.route("sale", &sale("s1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.into_iter().collect::<Vec<_>>(), vec!["100", "200"]);
    }
}
