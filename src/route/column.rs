//! Column-match router
//!
//! Expressions are clauses of the form `COLUMN op VALUE`, joined by `OR`
//! or line breaks. A row is routed to the union of what every clause
//! selects. Values may be constants, `NULL`, `:NODE_ID`, `:EXTERNAL_ID`,
//! `:NODE_GROUP_ID` or `:OTHER_COLUMN`; `OLD_<COLUMN>` reads the pre-image.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DataRouter, Node, RouteContext};
use crate::error::{Error, Result};
use crate::model::RowEvent;

const NODE_ID: &str = ":NODE_ID";
const EXTERNAL_ID: &str = ":EXTERNAL_ID";
const NODE_GROUP_ID: &str = ":NODE_GROUP_ID";
const NULL_VALUE: &str = "NULL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOperator {
    Equals,
    NotEquals,
    /// Column holds a comma-separated list containing the value
    Contains,
    NotContains,
}

impl MatchOperator {
    /// Checked in this order so `!=` is not read as `=`
    const SYNTAX: [(&'static str, MatchOperator); 4] = [
        ("!=", MatchOperator::NotEquals),
        ("=", MatchOperator::Equals),
        (" not contains ", MatchOperator::NotContains),
        (" contains ", MatchOperator::Contains),
    ];

    fn test(&self, column_value: Option<&str>, compare: Option<&str>) -> bool {
        match self {
            MatchOperator::Equals => column_value == compare,
            MatchOperator::NotEquals => column_value != compare,
            MatchOperator::Contains => match (column_value, compare) {
                (Some(list), Some(value)) => list.split(',').any(|item| item == value),
                _ => false,
            },
            MatchOperator::NotContains => match (column_value, compare) {
                (Some(list), Some(value)) => !list.split(',').any(|item| item == value),
                _ => false,
            },
        }
    }
}

/// One `COLUMN op VALUE` clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchClause {
    pub column: String,
    pub operator: MatchOperator,
    pub value: String,
}

impl MatchClause {
    /// Parse a full expression into its clauses
    pub fn parse_expression(expression: &str) -> Result<Vec<MatchClause>> {
        let mut clauses = Vec::new();
        for line in expression.split(['\r', '\n']) {
            for part in split_or(line) {
                let part = part.trim();
                if !part.is_empty() {
                    clauses.push(Self::parse(part, expression)?);
                }
            }
        }
        if clauses.is_empty() {
            tracing::warn!("The column match expression is empty");
        }
        Ok(clauses)
    }

    fn parse(clause: &str, expression: &str) -> Result<MatchClause> {
        for (syntax, operator) in MatchOperator::SYNTAX {
            let found = if syntax.trim() == syntax {
                clause.find(syntax)
            } else {
                find_ignore_case(clause, syntax)
            };
            if let Some(at) = found {
                let column = clause[..at].trim();
                let value = clause[at + syntax.len()..].trim();
                if column.is_empty() || value.is_empty() {
                    break;
                }
                return Ok(MatchClause {
                    column: column.to_string(),
                    operator,
                    value: unquote(value),
                });
            }
        }
        Err(Error::RouterExpression {
            expression: expression.to_string(),
            reason: format!("invalid clause '{}'", clause),
        })
    }
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().find(&needle.to_ascii_lowercase())
}

/// Split on a standalone `or` outside single quotes
fn split_or(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let bytes = line.as_bytes();
    let mut in_quote = false;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_quote = !in_quote,
            b'o' | b'O' if !in_quote => {
                let before_ok = i == 0 || bytes[i - 1].is_ascii_whitespace();
                let is_or = bytes.get(i + 1).map_or(false, |b| b.eq_ignore_ascii_case(&b'r'));
                let after_ok = bytes.get(i + 2).map_or(true, |b| b.is_ascii_whitespace());
                if before_ok && is_or && after_ok {
                    parts.push(&line[start..i]);
                    start = i + 2;
                    i += 2;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&line[start..]);
    parts
}

/// Strip surrounding ticks; doubled ticks inside become one
fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        value[1..value.len() - 1].replace("''", "'")
    } else {
        value.to_string()
    }
}

/// Column value as the router sees it; `OLD_` addresses the pre-image
fn column_value<'e>(event: &'e RowEvent, column: &str) -> Option<&'e str> {
    let known = event.column_names.iter().any(|c| c.eq_ignore_ascii_case(column));
    if !known && column.get(..4).map_or(false, |p| p.eq_ignore_ascii_case("OLD_")) {
        return column.get(4..).and_then(|name| event.old_value(name));
    }
    if event.event_type.carries_row() {
        event.value(column)
    } else {
        event.old_value(column).or_else(|| event.key_value(column))
    }
}

fn node_id(node: &Node) -> Option<&str> {
    Some(node.id.as_str())
}

fn node_external_id(node: &Node) -> Option<&str> {
    node.external_id.as_deref()
}

fn node_group_id(node: &Node) -> Option<&str> {
    Some(node.group_id.as_str())
}

/// Router evaluating column-match expressions, with parsed expressions cached
#[derive(Default)]
pub struct ColumnMatchRouter {
    cache: RwLock<HashMap<String, Arc<Vec<MatchClause>>>>,
}

impl ColumnMatchRouter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn clauses(&self, expression: &str) -> Result<Arc<Vec<MatchClause>>> {
        if let Some(clauses) = self.cache.read().await.get(expression) {
            return Ok(Arc::clone(clauses));
        }
        let clauses = Arc::new(MatchClause::parse_expression(expression)?);
        self.cache
            .write()
            .await
            .insert(expression.to_string(), Arc::clone(&clauses));
        Ok(clauses)
    }
}

#[async_trait]
impl DataRouter for ColumnMatchRouter {
    async fn route(
        &self,
        context: &RouteContext<'_>,
        event: &RowEvent,
        candidates: &[Node],
    ) -> Result<BTreeSet<String>> {
        let clauses = self.clauses(&context.subscription.router_expression).await?;
        let mut targets = BTreeSet::new();

        for clause in clauses.iter() {
            let value = column_value(event, &clause.column);
            let per_node: Option<fn(&Node) -> Option<&str>> =
                match clause.value.to_ascii_uppercase().as_str() {
                    NODE_ID => Some(node_id),
                    EXTERNAL_ID => Some(node_external_id),
                    NODE_GROUP_ID => Some(node_group_id),
                    _ => None,
                };

            match per_node {
                Some(attribute) => {
                    for node in candidates {
                        if clause.operator.test(value, attribute(node)) {
                            targets.insert(node.id.clone());
                        }
                    }
                }
                None => {
                    let compare = if clause.value == NULL_VALUE {
                        None
                    } else if let Some(other) = clause.value.strip_prefix(':') {
                        column_value(event, other)
                    } else {
                        Some(clause.value.as_str())
                    };
                    if clause.operator.test(value, compare) {
                        targets.extend(candidates.iter().map(|n| n.id.clone()));
                    }
                }
            }
        }

        Ok(targets)
    }

    async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableIdentity;
    use crate::route::Subscription;

    #[test]
    fn test_parse_or_and_line_breaks() {
        let clauses = MatchClause::parse_expression("one=two OR three=four\r\nor   five!=:EXTERNAL_ID").unwrap();
        assert_eq!(clauses.len(), 3);
        assert_eq!(clauses[0].value, "two");
        assert_eq!(clauses[1].column, "three");
        assert_eq!(clauses[2].column, "five");
        assert_eq!(clauses[2].operator, MatchOperator::NotEquals);
    }

    #[test]
    fn test_parse_quotes_and_or_in_names() {
        let clauses = MatchClause::parse_expression("one='two or three' or seven='can''t'\nORDER_ID=:EXTERNAL_ID").unwrap();
        assert_eq!(clauses.len(), 3);
        assert_eq!(clauses[0].value, "two or three");
        assert_eq!(clauses[1].value, "can't");
        assert_eq!(clauses[2].column, "ORDER_ID");

        let contains = MatchClause::parse_expression("REGIONS contains 'west'").unwrap();
        assert_eq!(contains[0].operator, MatchOperator::Contains);
        let not_contains = MatchClause::parse_expression("REGIONS not contains west").unwrap();
        assert_eq!(not_contains[0].operator, MatchOperator::NotContains);

        assert!(MatchClause::parse_expression("just garbage").is_err());
    }

    fn nodes() -> Vec<Node> {
        vec![
            Node::new("100", "store").with_external_id("s1"),
            Node::new("200", "store").with_external_id("s2"),
            Node::new("300", "store"),
        ]
    }

    fn event(store: Option<&str>) -> RowEvent {
        RowEvent::update(
            TableIdentity::new("item"),
            vec!["ID".into(), "STORE_ID".into(), "REGIONS".into()],
            vec!["ID".into()],
            vec![Some("1".into()), store.map(str::to_string), Some("west,north".into())],
            Some(vec![Some("1".into()), Some("s2".into()), None]),
        )
    }

    async fn route(expression: &str, event: &RowEvent) -> Vec<String> {
        let router = ColumnMatchRouter::new();
        let source = Node::new("000", "corp");
        let sub = Subscription::new("s", "corp", "store", "item")
            .with_router(super::super::RouterType::Column, expression);
        let context = RouteContext {
            source_node: &source,
            subscription: &sub,
        };
        router.route(&context, event, &nodes()).await.unwrap().into_iter().collect()
    }

    #[tokio::test]
    async fn test_node_attribute_matching() {
        assert_eq!(route("STORE_ID=:EXTERNAL_ID", &event(Some("s1"))).await, vec!["100"]);
        assert_eq!(route("ID != :NODE_ID", &event(Some("s1"))).await, vec!["100", "200", "300"]);
        assert_eq!(route("OLD_STORE_ID=:EXTERNAL_ID", &event(Some("s1"))).await, vec!["200"]);
    }

    #[tokio::test]
    async fn test_constant_and_null_matching() {
        assert_eq!(route("STORE_ID=NULL", &event(None)).await.len(), 3);
        assert!(route("STORE_ID=NULL", &event(Some("s1"))).await.is_empty());
        assert_eq!(route("REGIONS contains north", &event(None)).await.len(), 3);
        assert!(route("REGIONS contains south", &event(None)).await.is_empty());
        assert_eq!(route("STORE_ID=:OLD_STORE_ID", &event(Some("s2"))).await.len(), 3);
    }
}
