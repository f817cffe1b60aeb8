//! Outgoing batch assembly
//!
//! Routed events are appended, in arrival order, to the open batch of their
//! target node. A batch is sealed when it reaches the event or byte limit,
//! or when the caller reaches a commit boundary and calls `seal_all`.

use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::model::{Batch, BatchId, BatchStatus, BinaryEncoding, RowEvent};

/// Builds the outgoing batches of one source node on one channel
#[derive(Debug)]
pub struct OutgoingBatcher {
    source_node_id: String,
    channel_id: String,
    max_events: usize,
    max_bytes: u64,
    encoding: BinaryEncoding,
    initial_load: bool,
    open: BTreeMap<String, Batch>,
    sealed: Vec<Batch>,
    next_ids: HashMap<String, BatchId>,
}

impl OutgoingBatcher {
    pub fn new(
        source_node_id: impl Into<String>,
        channel_id: impl Into<String>,
        max_events: usize,
        max_bytes: u64,
    ) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            channel_id: channel_id.into(),
            max_events: max_events.max(1),
            max_bytes: max_bytes.max(1),
            encoding: BinaryEncoding::None,
            initial_load: false,
            open: BTreeMap::new(),
            sealed: Vec::new(),
            next_ids: HashMap::new(),
        }
    }

    pub fn with_encoding(mut self, encoding: BinaryEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Mark every batch built here as an initial load
    pub fn initial_load(mut self) -> Self {
        self.initial_load = true;
        self
    }

    /// Seed the id sequence of a target from persisted state
    pub fn with_next_id(mut self, target_node_id: impl Into<String>, next: BatchId) -> Self {
        self.next_ids.insert(target_node_id.into(), next.max(1));
        self
    }

    /// Id the next sealed batch for `target_node_id` will get
    pub fn next_id(&self, target_node_id: &str) -> BatchId {
        self.next_ids.get(target_node_id).copied().unwrap_or(1)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Append a routed event to the target's open batch
    pub fn append(&mut self, target_node_id: &str, event: RowEvent) -> Result<()> {
        let batch = self
            .open
            .entry(target_node_id.to_string())
            .or_insert_with(|| {
                let mut batch = Batch::new(
                    self.source_node_id.clone(),
                    Some(target_node_id.to_string()),
                    self.channel_id.clone(),
                );
                batch.binary_encoding = self.encoding;
                batch.initial_load = self.initial_load;
                batch
            });
        batch.push(event);

        if batch.event_count() >= self.max_events || batch.byte_count >= self.max_bytes {
            self.seal(target_node_id)?;
        }
        Ok(())
    }

    /// Close the open batch of a target, assigning its id
    pub fn seal(&mut self, target_node_id: &str) -> Result<()> {
        let Some(mut batch) = self.open.remove(target_node_id) else {
            return Ok(());
        };
        let id = self.next_id(target_node_id);
        batch.batch_id = id;
        batch.transition(BatchStatus::Routed)?;
        self.next_ids.insert(target_node_id.to_string(), id + 1);

        tracing::debug!(
            "Sealed batch {} for {} on {} with {} events ({} bytes)",
            batch.node_batch_id(),
            target_node_id,
            self.channel_id,
            batch.event_count(),
            batch.byte_count
        );
        self.sealed.push(batch);
        Ok(())
    }

    /// Seal every open batch; called at a commit boundary
    pub fn seal_all(&mut self) -> Result<()> {
        let targets: Vec<String> = self.open.keys().cloned().collect();
        for target in targets {
            self.seal(&target)?;
        }
        Ok(())
    }

    pub fn has_open(&self) -> bool {
        !self.open.is_empty()
    }

    /// Seal what is left and hand out every sealed batch in seal order
    pub fn finish(mut self) -> Result<Vec<Batch>> {
        self.seal_all()?;
        Ok(self.sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableIdentity;

    fn event(id: u64) -> RowEvent {
        RowEvent::insert(
            TableIdentity::new("t"),
            vec!["id".into()],
            vec!["id".into()],
            vec![Some(id.to_string())],
        )
        .with_source_data_id(id)
    }

    #[test]
    fn test_exact_threshold_seals_and_next_starts_new_batch() {
        let mut batcher = OutgoingBatcher::new("src", "default", 3, u64::MAX);
        for id in 1..=3 {
            batcher.append("n1", event(id)).unwrap();
        }
        assert!(!batcher.has_open());
        batcher.append("n1", event(4)).unwrap();

        let batches = batcher.finish().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].batch_id, 1);
        assert_eq!(batches[0].event_count(), 3);
        assert_eq!(batches[1].batch_id, 2);
        assert_eq!(batches[1].events[0].source_data_id, 4);
        assert!(batches.iter().all(|b| b.status == BatchStatus::Routed));
    }

    #[test]
    fn test_sequences_are_per_target() {
        let mut batcher = OutgoingBatcher::new("src", "default", 10, u64::MAX)
            .with_next_id("n2", 41)
            .with_encoding(BinaryEncoding::Base64);
        batcher.append("n1", event(1)).unwrap();
        batcher.append("n2", event(2)).unwrap();
        batcher.append("n1", event(3)).unwrap();
        batcher.seal_all().unwrap();
        batcher.append("n2", event(4)).unwrap();
        assert_eq!(batcher.next_id("n2"), 42);

        let batches = batcher.finish().unwrap();
        let ids: Vec<_> = batches
            .iter()
            .map(|b| (b.target_node_id.clone().unwrap(), b.batch_id))
            .collect();
        assert_eq!(
            ids,
            vec![("n1".into(), 1), ("n2".into(), 41), ("n2".into(), 42)]
        );
        let n1: Vec<_> = batches[0].events.iter().map(|e| e.source_data_id).collect();
        assert_eq!(n1, vec![1, 3]);
        assert_eq!(batches[0].binary_encoding, BinaryEncoding::Base64);
    }

    #[test]
    fn test_byte_threshold() {
        let mut batcher = OutgoingBatcher::new("src", "default", 100, 1);
        batcher.append("n1", event(1)).unwrap();
        batcher.append("n1", event(2)).unwrap();
        let batches = batcher.finish().unwrap();
        assert_eq!(batches.len(), 2);
    }
}
