//! Transport
//!
//! Moves staged batch payloads between nodes. Payload bytes are carried
//! untouched; the receiver acknowledges each delivery once it has loaded
//! (or refused) the batch.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::model::BatchFailure;
use crate::stage::StagedResource;

/// Receiver's answer to a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Loaded, already loaded, or recorded as ignored
    Ok,
    /// The receiver could not load the batch
    Failed(BatchFailure),
}

/// A payload arriving at a node
#[derive(Debug)]
pub struct Delivery {
    pub source_node_id: String,
    /// The resource as staged by the sender
    pub resource: StagedResource,
    pub payload: Vec<u8>,
    responder: Option<oneshot::Sender<Acknowledgement>>,
}

impl Delivery {
    pub fn new(
        source_node_id: impl Into<String>,
        resource: StagedResource,
        payload: Vec<u8>,
    ) -> (Self, oneshot::Receiver<Acknowledgement>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                source_node_id: source_node_id.into(),
                resource,
                payload,
                responder: Some(tx),
            },
            rx,
        )
    }

    /// Take the payload bytes, leaving the delivery empty
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }

    /// Answer the sender; a sender that gave up is not an error
    pub fn acknowledge(&mut self, ack: Acknowledgement) {
        if let Some(responder) = self.responder.take() {
            if responder.send(ack).is_err() {
                tracing::debug!(
                    "Sender {} stopped waiting for {}",
                    self.source_node_id,
                    self.resource.key
                );
            }
        }
    }
}

/// Node-to-node payload transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a staged payload and wait for the receiver's acknowledgement
    async fn send(
        &self,
        target_node_id: &str,
        resource: &StagedResource,
        payload: Vec<u8>,
    ) -> Result<Acknowledgement>;

    /// Next incoming delivery; `None` once the transport is closed
    async fn receive(&self) -> Result<Option<Delivery>>;
}

/// Registry of in-process node inboxes
#[derive(Clone, Default)]
pub struct InProcessNetwork {
    inboxes: Arc<RwLock<HashMap<String, mpsc::Sender<Delivery>>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node and get its transport
    pub async fn join(&self, node_id: impl Into<String>) -> ChannelTransport {
        let node_id = node_id.into();
        let (tx, rx) = mpsc::channel(64);
        self.inboxes.write().await.insert(node_id.clone(), tx);
        tracing::debug!("Node {} joined the in-process network", node_id);

        ChannelTransport {
            node_id,
            network: self.clone(),
            inbox: Mutex::new(rx),
            ack_timeout: Duration::from_secs(30),
        }
    }

    /// Detach a node; sends to it fail from now on
    pub async fn leave(&self, node_id: &str) {
        self.inboxes.write().await.remove(node_id);
    }
}

/// Transport between nodes living in one process, over tokio channels
pub struct ChannelTransport {
    node_id: String,
    network: InProcessNetwork,
    inbox: Mutex<mpsc::Receiver<Delivery>>,
    ack_timeout: Duration,
}

impl ChannelTransport {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(
        &self,
        target_node_id: &str,
        resource: &StagedResource,
        payload: Vec<u8>,
    ) -> Result<Acknowledgement> {
        let inbox = self
            .network
            .inboxes
            .read()
            .await
            .get(target_node_id)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("node {} is not reachable", target_node_id)))?;

        let (delivery, ack) = Delivery::new(self.node_id.clone(), resource.clone(), payload);
        inbox
            .send(delivery)
            .await
            .map_err(|_| Error::Transport(format!("node {} stopped receiving", target_node_id)))?;

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "node {} dropped {} without acknowledging",
                target_node_id, resource.key
            ))),
            Err(_) => Err(Error::ConnectionTimeout(target_node_id.to_string())),
        }
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        Ok(self.inbox.lock().await.recv().await)
    }
}
