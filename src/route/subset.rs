//! Subset router
//!
//! `nodes:a,b,c` routes to the listed node ids. `column:NAME` reads a
//! comma-separated list from the row and routes to nodes whose id or
//! external id appears in it.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::{DataRouter, Node, RouteContext};
use crate::error::{Error, Result};
use crate::model::RowEvent;

#[derive(Debug, Default, Clone, Copy)]
pub struct SubsetRouter;

enum Subset<'a> {
    Nodes(Vec<&'a str>),
    Column(&'a str),
}

fn parse(expression: &str) -> Result<Subset<'_>> {
    let invalid = |reason: &str| Error::RouterExpression {
        expression: expression.to_string(),
        reason: reason.to_string(),
    };
    let (kind, rest) = expression
        .trim()
        .split_once(':')
        .ok_or_else(|| invalid("expected nodes:<ids> or column:<name>"))?;

    match kind.trim().to_ascii_lowercase().as_str() {
        "nodes" => Ok(Subset::Nodes(
            rest.split(',').map(str::trim).filter(|s| !s.is_empty()).collect(),
        )),
        "column" if !rest.trim().is_empty() => Ok(Subset::Column(rest.trim())),
        "column" => Err(invalid("missing column name")),
        _ => Err(invalid("unknown subset kind")),
    }
}

#[async_trait]
impl DataRouter for SubsetRouter {
    async fn route(
        &self,
        context: &RouteContext<'_>,
        event: &RowEvent,
        candidates: &[Node],
    ) -> Result<BTreeSet<String>> {
        let wanted: Vec<&str> = match parse(&context.subscription.router_expression)? {
            Subset::Nodes(ids) => ids,
            Subset::Column(column) => event
                .current_value(column)
                .map(|list| list.split(',').map(str::trim).collect())
                .unwrap_or_default(),
        };

        Ok(candidates
            .iter()
            .filter(|node| {
                wanted.iter().any(|w| {
                    *w == node.id || node.external_id.as_deref() == Some(*w)
                })
            })
            .map(|node| node.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableIdentity;
    use crate::route::{RouterType, Subscription};

    async fn route(expression: &str) -> Result<BTreeSet<String>> {
        let source = Node::new("000", "corp");
        let sub = Subscription::new("s", "corp", "store", "default")
            .with_router(RouterType::Subset, expression);
        let context = RouteContext {
            source_node: &source,
            subscription: &sub,
        };
        let event = RowEvent::insert(
            TableIdentity::new("promo"),
            vec!["id".into(), "stores".into()],
            vec!["id".into()],
            vec![Some("1".into()), Some("s2, 300".into())],
        );
        let candidates = vec![
            Node::new("100", "store").with_external_id("s1"),
            Node::new("200", "store").with_external_id("s2"),
            Node::new("300", "store"),
        ];
        SubsetRouter.route(&context, &event, &candidates).await
    }

    #[tokio::test]
    async fn test_static_node_list() {
        let targets = route("nodes: 100,300,999").await.unwrap();
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["100", "300"]);
    }

    #[tokio::test]
    async fn test_column_list() {
        let targets = route("column:STORES").await.unwrap();
        assert_eq!(targets.into_iter().collect::<Vec<_>>(), vec!["200", "300"]);
    }

    #[tokio::test]
    async fn test_bad_expression() {
        assert!(route("everyone").await.is_err());
        assert!(route("column:").await.is_err());
    }
}
