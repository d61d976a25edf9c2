//! HTTP implementation of the cluster transport.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::ClusterTransport;
use super::protocol::{
    BeginMigrationRequest, ENDPOINT_BEGIN_MIGRATION, ENDPOINT_CP, ENDPOINT_INVOKE, ENDPOINT_RAFT,
    ENDPOINT_REPLICATE, ENDPOINT_SNAPSHOT, ENDPOINT_TABLE, ENDPOINT_TOPIC, TableAck, WireResult,
};
use crate::cp::{CpRequest, CpResponse, RaftMessage};
use crate::error::{GridError, GridResult};
use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::partition::{PartitionId, PartitionTable};
use crate::primitives::topic::TopicMessage;
use crate::storage::types::{Invocation, OpRecord, OperationResult, PartitionSnapshot};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const ATTEMPTS: usize = 3;

/// Resolves node ids to HTTP addresses through membership.
pub struct HttpTransport {
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(membership: Arc<MembershipService>) -> Arc<Self> {
        Arc::new(Self {
            membership,
            http_client: reqwest::Client::new(),
        })
    }

    fn url(&self, target: &NodeId, path: &str) -> GridResult<String> {
        let node = self
            .membership
            .get_member(target)
            .ok_or_else(|| GridError::transport(target, "unknown node"))?;
        Ok(format!("http://{}{}", node.http_addr, path))
    }

    async fn post_with_retry<T, R>(
        &self,
        target: &NodeId,
        path: &str,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> GridResult<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(target, path)?;
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return decode(target, resp).await,
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(GridError::transport(target, e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(GridError::transport(target, "retry attempts exhausted"))
    }

    async fn get_with_retry<R: DeserializeOwned>(
        &self,
        target: &NodeId,
        path: &str,
        timeout: Duration,
        attempts: usize,
    ) -> GridResult<R> {
        let url = self.url(target, path)?;
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .get(url.clone())
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return decode(target, resp).await,
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(GridError::transport(target, e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(GridError::transport(target, "retry attempts exhausted"))
    }
}

async fn decode<R: DeserializeOwned>(target: &NodeId, resp: reqwest::Response) -> GridResult<R> {
    if !resp.status().is_success() {
        return Err(GridError::transport(target, format!("HTTP {}", resp.status())));
    }
    resp.json::<WireResult<R>>()
        .await
        .map_err(|e| GridError::transport(target, e))?
}

#[async_trait]
impl ClusterTransport for HttpTransport {
    async fn invoke(&self, target: &NodeId, invocation: Invocation) -> GridResult<OperationResult> {
        self.post_with_retry(target, ENDPOINT_INVOKE, &invocation, REQUEST_TIMEOUT, ATTEMPTS)
            .await
    }

    async fn replicate(&self, target: &NodeId, record: OpRecord) -> GridResult<()> {
        // The replicator retries on its own.
        self.post_with_retry(target, ENDPOINT_REPLICATE, &record, REQUEST_TIMEOUT, 1)
            .await
    }

    async fn begin_migration(&self, target: &NodeId, partition: PartitionId) -> GridResult<()> {
        self.post_with_retry(
            target,
            ENDPOINT_BEGIN_MIGRATION,
            &BeginMigrationRequest { partition },
            REQUEST_TIMEOUT,
            ATTEMPTS,
        )
        .await
    }

    async fn fetch_snapshot(
        &self,
        target: &NodeId,
        partition: PartitionId,
    ) -> GridResult<PartitionSnapshot> {
        let path = format!("{}/{}", ENDPOINT_SNAPSHOT, partition);
        self.get_with_retry(target, &path, SNAPSHOT_TIMEOUT, ATTEMPTS)
            .await
    }

    async fn install_snapshot(&self, target: &NodeId, snapshot: PartitionSnapshot) -> GridResult<()> {
        self.post_with_retry(target, ENDPOINT_SNAPSHOT, &snapshot, SNAPSHOT_TIMEOUT, ATTEMPTS)
            .await
    }

    async fn publish_table(&self, target: &NodeId, table: PartitionTable) -> GridResult<u64> {
        let ack: TableAck = self
            .post_with_retry(target, ENDPOINT_TABLE, &table, REQUEST_TIMEOUT, ATTEMPTS)
            .await?;
        Ok(ack.version)
    }

    async fn deliver_topic(&self, target: &NodeId, message: TopicMessage) -> GridResult<()> {
        self.post_with_retry(target, ENDPOINT_TOPIC, &message, REQUEST_TIMEOUT, 1)
            .await
    }

    async fn send_raft(&self, target: &NodeId, message: RaftMessage) -> GridResult<()> {
        // Raft retransmits on its own timers.
        self.post_with_retry(target, ENDPOINT_RAFT, &message, REQUEST_TIMEOUT, 1)
            .await
    }

    async fn cp_request(&self, target: &NodeId, request: CpRequest) -> GridResult<CpResponse> {
        self.post_with_retry(target, ENDPOINT_CP, &request, REQUEST_TIMEOUT, 1)
            .await
    }
}
