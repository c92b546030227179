//! Peer node registry clients.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use uuid::Uuid;

use crate::config::DpnConfig;
use crate::models::{DpnBag, DpnReplicationTransfer};

/// REST surface of one peer node's replication registry.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_bag(&self, uuid: Uuid) -> anyhow::Result<Option<DpnBag>>;

    /// Create-or-update a bag record.
    async fn save_bag(&self, bag: &DpnBag) -> anyhow::Result<DpnBag>;

    /// Push a transfer's new status (and receipt fields) back to the node
    /// that issued it.
    async fn update_transfer(
        &self,
        transfer: &DpnReplicationTransfer,
    ) -> anyhow::Result<DpnReplicationTransfer>;

    /// Transfers addressed to `to_node`, optionally only those created
    /// after `after` (the scanner's checkpoint filter).
    async fn list_transfers(
        &self,
        to_node: &str,
        after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<DpnReplicationTransfer>>;
}

/// Lookup table namespace → client for every configured peer.
#[derive(Default)]
pub struct NodeClients {
    clients: HashMap<String, Arc<dyn NodeClient>>,
}

impl NodeClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP clients for every peer in the config.
    pub fn from_config(config: &DpnConfig) -> Self {
        let mut clients = Self::new();
        for node in &config.remote_nodes {
            clients.insert(&node.namespace, Arc::new(HttpNodeClient::new(&node.api_url, &node.api_token)));
        }
        clients
    }

    pub fn insert(&mut self, namespace: &str, client: Arc<dyn NodeClient>) {
        self.clients.insert(namespace.to_string(), client);
    }

    pub fn get(&self, namespace: &str) -> anyhow::Result<Arc<dyn NodeClient>> {
        self.clients
            .get(namespace)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no client configured for node {namespace}"))
    }
}

/// REST client for a peer node.
pub struct HttpNodeClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpNodeClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("Authorization", format!("Token {}", self.token))
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn get_bag(&self, uuid: Uuid) -> anyhow::Result<Option<DpnBag>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/bags/{uuid}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }

    async fn save_bag(&self, bag: &DpnBag) -> anyhow::Result<DpnBag> {
        let exists = self.get_bag(bag.uuid).await?.is_some();
        let (method, path) = if exists {
            (reqwest::Method::PUT, format!("/bags/{}", bag.uuid))
        } else {
            (reqwest::Method::POST, "/bags".to_string())
        };
        let response = self.request(method, &path).json(bag).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    async fn update_transfer(
        &self,
        transfer: &DpnReplicationTransfer,
    ) -> anyhow::Result<DpnReplicationTransfer> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/replicate/{}", transfer.replication_id),
            )
            .json(transfer)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn list_transfers(
        &self,
        to_node: &str,
        after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<DpnReplicationTransfer>> {
        let mut query = vec![("to_node", to_node.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        let response = self
            .request(reqwest::Method::GET, "/replicate")
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// In-memory peer node for tests.
#[derive(Default)]
pub struct MemoryNodeClient {
    bags: Mutex<HashMap<Uuid, DpnBag>>,
    transfers: Mutex<HashMap<Uuid, DpnReplicationTransfer>>,
}

impl MemoryNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_transfer(&self, transfer: DpnReplicationTransfer) {
        self.transfers
            .lock()
            .unwrap()
            .insert(transfer.replication_id, transfer);
    }

    pub fn seed_bag(&self, bag: DpnBag) {
        self.bags.lock().unwrap().insert(bag.uuid, bag);
    }

    pub fn transfer(&self, replication_id: Uuid) -> Option<DpnReplicationTransfer> {
        self.transfers.lock().unwrap().get(&replication_id).cloned()
    }

    pub fn bag(&self, uuid: Uuid) -> Option<DpnBag> {
        self.bags.lock().unwrap().get(&uuid).cloned()
    }
}

#[async_trait]
impl NodeClient for MemoryNodeClient {
    async fn get_bag(&self, uuid: Uuid) -> anyhow::Result<Option<DpnBag>> {
        Ok(self.bags.lock().unwrap().get(&uuid).cloned())
    }

    async fn save_bag(&self, bag: &DpnBag) -> anyhow::Result<DpnBag> {
        self.bags.lock().unwrap().insert(bag.uuid, bag.clone());
        Ok(bag.clone())
    }

    async fn update_transfer(
        &self,
        transfer: &DpnReplicationTransfer,
    ) -> anyhow::Result<DpnReplicationTransfer> {
        let mut transfers = self.transfers.lock().unwrap();
        let existing = transfers
            .get(&transfer.replication_id)
            .ok_or_else(|| anyhow::anyhow!("unknown transfer {}", transfer.replication_id))?;
        if !existing.status.can_become(transfer.status) && existing.status != transfer.status {
            anyhow::bail!(
                "illegal transfer transition {:?} -> {:?}",
                existing.status,
                transfer.status
            );
        }
        transfers.insert(transfer.replication_id, transfer.clone());
        Ok(transfer.clone())
    }

    async fn list_transfers(
        &self,
        to_node: &str,
        after: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<DpnReplicationTransfer>> {
        Ok(self
            .transfers
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.to_node == to_node)
            .filter(|t| after.map(|a| t.created_at > a).unwrap_or(true))
            .cloned()
            .collect())
    }
}
