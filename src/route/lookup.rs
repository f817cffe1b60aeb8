//! Lookup-table router
//!
//! The expression names a table mapping row keys to node external ids:
//!
//! ```text
//! LOOKUP_TABLE=store_assignment
//! KEY_COLUMN=STORE_ID
//! LOOKUP_KEY_COLUMN=store_id
//! EXTERNAL_ID_COLUMN=node_external_id
//! ```
//!
//! The table is read once per expression and cached until invalidated.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DataRouter, Node, RouteContext};
use crate::error::{Error, Result};
use crate::model::{RowEvent, TableIdentity};
use crate::platform::{cell_text, Platform};

/// Parsed lookup-table expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupExpression {
    pub lookup_table: TableIdentity,
    /// Column of the routed row holding the key
    pub key_column: String,
    pub lookup_key_column: String,
    pub external_id_column: String,
}

impl LookupExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let mut settings = HashMap::new();
        for line in expression.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| Error::RouterExpression {
                expression: expression.to_string(),
                reason: format!("expected KEY=VALUE, got '{}'", line),
            })?;
            settings.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
        }

        let mut take = |name: &str| {
            settings
                .remove(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::RouterExpression {
                    expression: expression.to_string(),
                    reason: format!("{} is required", name),
                })
        };
        let table = take("LOOKUP_TABLE")?;
        let lookup_table = match table.split_once('.') {
            Some((schema, name)) => TableIdentity::with_schema(schema, name),
            None => TableIdentity::new(table),
        };

        Ok(Self {
            lookup_table,
            key_column: take("KEY_COLUMN")?,
            lookup_key_column: take("LOOKUP_KEY_COLUMN")?,
            external_id_column: take("EXTERNAL_ID_COLUMN")?,
        })
    }
}

type LookupMap = HashMap<String, BTreeSet<String>>;

/// Routes a row to the nodes its key maps to in a lookup table
pub struct LookupTableRouter {
    platform: Arc<dyn Platform>,
    cache: RwLock<HashMap<String, Arc<LookupMap>>>,
}

impl LookupTableRouter {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn load(&self, expression: &LookupExpression) -> Result<LookupMap> {
        let platform = self.platform.as_ref();
        let sql = format!(
            "SELECT {}, {} FROM {}",
            platform.quote_identifier(&expression.lookup_key_column),
            platform.quote_identifier(&expression.external_id_column),
            platform.qualified_table(&expression.lookup_table)
        );
        let rows = platform.query(&sql, &[]).await?;

        let mut map = LookupMap::new();
        for row in &rows {
            map.entry(cell_text(row, 0))
                .or_default()
                .insert(cell_text(row, 1));
        }
        tracing::debug!(
            "Loaded {} lookup keys from {}",
            map.len(),
            expression.lookup_table
        );
        Ok(map)
    }

    async fn lookup(&self, raw: &str, expression: &LookupExpression) -> Result<Arc<LookupMap>> {
        if let Some(map) = self.cache.read().await.get(raw) {
            return Ok(Arc::clone(map));
        }
        let map = Arc::new(self.load(expression).await?);
        self.cache
            .write()
            .await
            .insert(raw.to_string(), Arc::clone(&map));
        Ok(map)
    }
}

#[async_trait]
impl DataRouter for LookupTableRouter {
    async fn route(
        &self,
        context: &RouteContext<'_>,
        event: &RowEvent,
        candidates: &[Node],
    ) -> Result<BTreeSet<String>> {
        let raw = &context.subscription.router_expression;
        let expression = LookupExpression::parse(raw)?;
        let Some(key) = event.current_value(&expression.key_column) else {
            return Ok(BTreeSet::new());
        };

        let map = self.lookup(raw, &expression).await?;
        let Some(external_ids) = map.get(key) else {
            return Ok(BTreeSet::new());
        };

        Ok(candidates
            .iter()
            .filter(|node| {
                node.external_id
                    .as_ref()
                    .map_or(false, |id| external_ids.contains(id))
            })
            .map(|node| node.id.clone())
            .collect())
    }

    async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SqlitePlatform;
    use crate::route::{RouterType, Subscription};

    const EXPRESSION: &str = "LOOKUP_TABLE=assignment\nKEY_COLUMN=REGION\n\
                              LOOKUP_KEY_COLUMN=region_id\nEXTERNAL_ID_COLUMN=store";

    #[test]
    fn test_parse_expression() {
        let parsed = LookupExpression::parse(EXPRESSION).unwrap();
        assert_eq!(parsed.lookup_table, TableIdentity::new("assignment"));
        assert_eq!(parsed.key_column, "REGION");

        assert!(LookupExpression::parse("LOOKUP_TABLE=x").is_err());
        assert!(LookupExpression::parse("nonsense").is_err());
    }

    #[tokio::test]
    async fn test_routes_through_lookup_table() {
        let platform = SqlitePlatform::open_in_memory().unwrap();
        platform
            .execute_batch(
                "CREATE TABLE assignment (region_id TEXT, store TEXT);
                 INSERT INTO assignment VALUES ('west', 's1'), ('west', 's3'), ('east', 's2');",
            )
            .await
            .unwrap();
        let router = LookupTableRouter::new(Arc::new(platform.clone()));

        let source = Node::new("000", "corp");
        let sub = Subscription::new("s", "corp", "store", "default")
            .with_router(RouterType::LookupTable, EXPRESSION);
        let context = RouteContext {
            source_node: &source,
            subscription: &sub,
        };
        let candidates = vec![
            Node::new("100", "store").with_external_id("s1"),
            Node::new("200", "store").with_external_id("s2"),
            Node::new("300", "store").with_external_id("s3"),
        ];
        let event = |region: &str| {
            RowEvent::insert(
                TableIdentity::new("sale"),
                vec!["id".into(), "region".into()],
                vec!["id".into()],
                vec![Some("1".into()), Some(region.into())],
            )
        };

        let west = router.route(&context, &event("west"), &candidates).await.unwrap();
        assert_eq!(west.into_iter().collect::<Vec<_>>(), vec!["100", "300"]);
        assert!(router
            .route(&context, &event("north"), &candidates)
            .await
            .unwrap()
            .is_empty());

        // Cached until invalidated
        platform
            .execute_batch("INSERT INTO assignment VALUES ('north', 's2');")
            .await
            .unwrap();
        assert!(router
            .route(&context, &event("north"), &candidates)
            .await
            .unwrap()
            .is_empty());
        router.invalidate().await;
        let north = router.route(&context, &event("north"), &candidates).await.unwrap();
        assert_eq!(north.into_iter().collect::<Vec<_>>(), vec!["200"]);
    }
}
