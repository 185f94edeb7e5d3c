// In-process implementations of the storage, audit and mempool contracts.
//
// These back development nodes and the test-suite. Signatures use a keyed
// SHA3 digest (hex(SHA3-256(secret || message))) in place of the node's
// production signature scheme.

use async_trait::async_trait;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use sha3::{Digest, Sha3_256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::services::{AuditEvent, AuditLog, ChainStorage, Mempool, Severity};
use crate::types::Block;

pub struct InMemoryChainStorage {
    blocks: RwLock<BTreeMap<u64, Block>>,
    height_override: RwLock<Option<u64>>,
    voting_window: RwLock<(u64, u64)>,
    keys: RwLock<HashMap<String, Vec<u8>>>,
    online: AtomicBool,
}

impl Default for InMemoryChainStorage {
    fn default() -> Self {
        InMemoryChainStorage {
            blocks: RwLock::new(BTreeMap::new()),
            height_override: RwLock::new(None),
            // Empty window: start after end means voting is never scheduled.
            voting_window: RwLock::new((1, 0)),
            keys: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
        }
    }
}

impl InMemoryChainStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `block` as the canonical block at its height.
    pub fn insert_block(&self, block: Block) {
        self.blocks.write().insert(block.header.height, block);
    }

    /// Pin the reported chain height regardless of stored blocks.
    pub fn set_current_height(&self, height: u64) {
        *self.height_override.write() = Some(height);
    }

    pub fn set_voting_window(&self, start: u64, end: u64) {
        *self.voting_window.write() = (start, end);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn register_key(&self, address: impl Into<String>, secret: impl Into<Vec<u8>>) {
        self.keys.write().insert(address.into(), secret.into());
    }

    pub fn keyed_digest(secret: &[u8], message: &str) -> String {
        let mut hasher = Sha3_256::new();
        hasher.update(secret);
        hasher.update(message.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Sign `message` with the registered key of `address`.
    pub fn sign(&self, address: &str, message: &str) -> Option<String> {
        self.keys
            .read()
            .get(address)
            .map(|secret| Self::keyed_digest(secret, message))
    }
}

#[async_trait]
impl ChainStorage for InMemoryChainStorage {
    async fn current_height(&self) -> anyhow::Result<u64> {
        if let Some(height) = *self.height_override.read() {
            return Ok(height);
        }
        Ok(self.blocks.read().keys().next_back().copied().unwrap_or(0))
    }

    async fn block_by_height(&self, height: u64) -> anyhow::Result<Option<Block>> {
        Ok(self.blocks.read().get(&height).cloned())
    }

    async fn voting_start_height(&self) -> anyhow::Result<u64> {
        Ok(self.voting_window.read().0)
    }

    async fn voting_end_height(&self) -> anyhow::Result<u64> {
        Ok(self.voting_window.read().1)
    }

    async fn verify_signature(
        &self,
        address: &str,
        message: &str,
        signature: &str,
    ) -> anyhow::Result<bool> {
        let keys = self.keys.read();
        let Some(secret) = keys.get(address) else {
            return Ok(false);
        };
        Ok(Self::keyed_digest(secret, message) == signature)
    }

    async fn ping(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Audit log that writes through the `log` facade and keeps every event.
#[derive(Default)]
pub struct LogAuditLog {
    events: Mutex<Vec<(String, AuditEvent)>>,
    next_id: AtomicU64,
}

impl LogAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, e)| e.event_type == event_type)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl AuditLog for LogAuditLog {
    async fn log_event(&self, event: AuditEvent) -> anyhow::Result<String> {
        let id = format!("audit-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        match event.severity {
            Severity::Info => info!("[audit {}] {} from {}: {}", id, event.event_type, event.source, event.details),
            Severity::Warning => warn!("[audit {}] {} from {}: {}", id, event.event_type, event.source, event.details),
            Severity::Error | Severity::Critical => {
                error!("[audit {}] {} from {}: {}", id, event.event_type, event.source, event.details)
            }
        }
        self.events.lock().push((id.clone(), event));
        Ok(id)
    }

    async fn log(&self, event_type: &str, data: serde_json::Value) -> anyhow::Result<()> {
        self.log_event(AuditEvent::new(event_type, Severity::Info, "consensus", data))
            .await
            .map(|_| ())
    }
}

/// Mempool notifier that records every validation failure it is told about.
#[derive(Default)]
pub struct RecordingMempool {
    failures: Mutex<Vec<(String, String)>>,
}

impl RecordingMempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(reason_key, validators_csv)` pairs in arrival order.
    pub fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl Mempool for RecordingMempool {
    async fn handle_validation_failure(
        &self,
        reason_key: &str,
        validators_csv: &str,
    ) -> anyhow::Result<()> {
        warn!("Mempool notified of validation failure: {} [{}]", reason_key, validators_csv);
        self.failures
            .lock()
            .push((reason_key.to_string(), validators_csv.to_string()));
        Ok(())
    }
}
