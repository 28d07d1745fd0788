#![cfg(feature = "etcd")]

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, PutOptions, Txn,
    TxnOp, TxnOpResponse, WatchOptions,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::{
    CoordError, CoordMessage, CoordResult, CoordinationDriver, LockAttempt,
};

#[derive(Clone)]
pub struct EtcdCredentials {
    pub username: String,
    pub password: String,
}

/// A configuration builder for connecting to etcd. Call `connect()` to
/// obtain a connected coordinator.
pub struct EtcdCoordFactory {
    endpoints: Vec<String>,
    key_prefix: String,
    credentials: Option<EtcdCredentials>,
    timeout_seconds: Option<u64>,
}

impl EtcdCoordFactory {
    pub fn new(endpoints: Vec<String>, key_prefix: String) -> Self {
        Self {
            endpoints,
            key_prefix,
            credentials: None,
            timeout_seconds: None,
        }
    }

    pub fn with_credentials(mut self, credentials: EtcdCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub async fn connect(&self) -> CoordResult<EtcdCoordinator> {
        let mut opts = ConnectOptions::new();

        if let Some(ref creds) = self.credentials {
            opts =
                opts.with_user(creds.username.clone(), creds.password.clone());
        }

        if let Some(timeout) = self.timeout_seconds {
            opts = opts.with_timeout(Duration::from_secs(timeout));
        }

        let client = Client::connect(self.endpoints.clone(), Some(opts))
            .await
            .map_err(CoordError::connection)?;

        Ok(EtcdCoordinator {
            client,
            key_prefix: self.key_prefix.clone(),
            leases: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

/// Coordination driver backed by etcd: leases carry the ttl, transactions
/// implement the atomic lock primitives, watches implement pub/sub.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
    key_prefix: String,
    // Lease granted per locked key, needed for renewal
    leases: Arc<Mutex<HashMap<String, i64>>>,
}

impl EtcdCoordinator {
    pub async fn connect(
        endpoints: Vec<String>,
        key_prefix: String,
    ) -> CoordResult<Self> {
        EtcdCoordFactory::new(endpoints, key_prefix).connect().await
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}/lock/{}", self.key_prefix, key)
    }

    fn chan_key(&self, channel: &str) -> String {
        format!("{}/chan/{}", self.key_prefix, channel)
    }

    fn chan_root(&self) -> String {
        format!("{}/chan/", self.key_prefix)
    }
}

#[async_trait]
impl CoordinationDriver for EtcdCoordinator {
    async fn lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> CoordResult<LockAttempt> {
        let lock_key = self.lock_key(key);
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let mut client = self.client.clone();
        let lease = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(CoordError::backend)?;

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                lock_key.clone(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                lock_key.clone(),
                owner,
                Some(PutOptions::new().with_lease(lease.id())),
            )])
            .or_else(vec![TxnOp::get(lock_key.clone(), None)]);
        let resp = client.txn(txn).await.map_err(CoordError::backend)?;

        if resp.succeeded() {
            let mut leases = self.leases.lock().await;
            leases.insert(key.to_string(), lease.id());
            return Ok(LockAttempt::Acquired);
        }

        // Contention: the granted lease is unused
        let _ = client.lease_revoke(lease.id()).await;

        let mut holder = None;
        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    let value =
                        kv.value_str().map_err(CoordError::serialization)?;
                    holder = Some(value.to_string());
                }
            }
        }
        match holder {
            Some(holder) if holder == owner => {
                // Still ours from a previous acquisition; refresh the expiry
                self.renew(key, owner, ttl).await?;
                Ok(LockAttempt::Acquired)
            }
            Some(holder) => Ok(LockAttempt::Held { holder }),
            // The record vanished between the compare and the get; the
            // caller retries and will acquire
            None => Ok(LockAttempt::Held {
                holder: String::new(),
            }),
        }
    }

    async fn unlock(&self, key: &str, owner: &str) -> CoordResult<bool> {
        let lock_key = self.lock_key(key);
        let mut client = self.client.clone();

        let txn = Txn::new()
            .when(vec![Compare::value(
                lock_key.clone(),
                CompareOp::Equal,
                owner,
            )])
            .and_then(vec![TxnOp::delete(lock_key.clone(), None)]);
        let resp = client.txn(txn).await.map_err(CoordError::backend)?;

        let lease = {
            let mut leases = self.leases.lock().await;
            leases.remove(key)
        };
        if resp.succeeded() {
            if let Some(lease) = lease {
                let _ = client.lease_revoke(lease).await;
            }
        }
        Ok(resp.succeeded())
    }

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        _ttl: Duration,
    ) -> CoordResult<bool> {
        let lease = {
            let leases = self.leases.lock().await;
            leases.get(key).copied()
        };
        let Some(lease) = lease else {
            return Ok(false);
        };

        let mut client = self.client.clone();
        let alive = match client.lease_keep_alive(lease).await {
            Ok((mut keeper, mut stream)) => {
                keeper.keep_alive().await.map_err(CoordError::backend)?;
                match stream.message().await.map_err(CoordError::backend)? {
                    Some(resp) => resp.ttl() > 0,
                    None => false,
                }
            }
            Err(err) => {
                debug!(key, error = %err, "lease keep-alive failed");
                false
            }
        };
        if !alive {
            return Ok(false);
        }

        // The lease is alive; confirm the record is still ours
        let resp = client
            .get(self.lock_key(key), None)
            .await
            .map_err(CoordError::backend)?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| kv.value() == owner.as_bytes())
            .unwrap_or(false))
    }

    async fn force_unlock(&self, key: &str) -> CoordResult<()> {
        let mut client = self.client.clone();
        client
            .delete(self.lock_key(key), None)
            .await
            .map(|_| ())
            .map_err(CoordError::backend)
    }

    async fn publish(&self, channel: &str, payload: &str) -> CoordResult<()> {
        let mut client = self.client.clone();
        client
            .put(self.chan_key(channel), payload, None)
            .await
            .map(|_| ())
            .map_err(CoordError::backend)
    }

    async fn subscribe(
        &self,
        prefix: &str,
    ) -> CoordResult<mpsc::UnboundedReceiver<CoordMessage>> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(
                self.chan_key(prefix),
                Some(WatchOptions::new().with_prefix()),
            )
            .await
            .map_err(CoordError::backend)?;

        let chan_root = self.chan_root();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the subscription
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        warn!(
                            error = %CoordError::ChannelClosed,
                            "coordination watch stream ended"
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "coordination watch stream failed");
                        break;
                    }
                };
                for event in resp.events() {
                    if event.event_type() != EventType::Put {
                        continue;
                    }
                    let Some(kv) = event.kv() else { continue };
                    let (key, payload) = match (kv.key_str(), kv.value_str())
                    {
                        (Ok(key), Ok(payload)) => (key, payload),
                        (Err(err), _) | (_, Err(err)) => {
                            debug!(
                                error = %CoordError::serialization(err),
                                "skipping undecodable coordination message"
                            );
                            continue;
                        }
                    };
                    let Some(channel) = key.strip_prefix(&chan_root) else {
                        continue;
                    };
                    let msg = CoordMessage {
                        channel: channel.to_string(),
                        payload: payload.to_string(),
                    };
                    if tx.send(msg).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
