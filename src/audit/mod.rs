//! Audit trail for reconciliation runs
//!
//! Every run outcome is recorded with document fingerprints so a batch can be
//! traced back to the exact uploads that produced it. Events live in an
//! [`AuditStore`]; Postgres when configured, a bounded in-memory ring otherwise.

use crate::error::ReconciliationError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub const RUN_COMPLETED: &str = "reconciliation_run_completed";
pub const RUN_REJECTED: &str = "reconciliation_run_rejected";
pub const RUN_FAILED: &str = "reconciliation_run_failed";
pub const DOCUMENT_PROCESSED: &str = "document_processed";

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1_000;
pub const IN_MEMORY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: Uuid,
    pub event_type: String,
    pub details: Value,
    pub details_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Trait for audit event persistence
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>>;
    /// Most recent first, optionally restricted to one event type
    async fn recent(&self, event_type: Option<&str>, limit: usize) -> Result<Vec<AuditEvent>>;
}

/// In-memory audit store for development and tests.
/// Keeps the newest `capacity` events; older ones are dropped.
pub struct InMemoryAuditStore {
    events: Arc<RwLock<VecDeque<AuditEvent>>>,
    capacity: usize,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::with_capacity(IN_MEMORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        let mut events = self.events.write().await;
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().find(|e| e.id == id).cloned())
    }

    async fn recent(&self, event_type: Option<&str>, limit: usize) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;

        Ok(events
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Audit trail front end: builds and hashes events, delegates storage
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    /// Audit log backed by a fresh in-memory store
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryAuditStore::new()))
    }

    pub fn with_store(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Store an event
    pub async fn record(&self, event_type: &str, details: Value) -> Result<Uuid> {
        if event_type.trim().is_empty() {
            return Err(ReconciliationError::Audit(
                "event type must not be empty".to_string(),
            ));
        }

        let event = AuditEvent {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            details_hash: compute_details_hash(&details),
            details,
            timestamp: Utc::now(),
        };
        let id = event.id;

        self.store.append(event).await?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<AuditEvent>> {
        self.store.get(id).await
    }

    /// Newest events first, at most `limit` (capped at [`MAX_LIST_LIMIT`])
    pub async fn list(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.store.recent(None, limit.min(MAX_LIST_LIMIT)).await
    }

    /// Newest events of one type first
    pub async fn list_by_type(&self, event_type: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        self.store
            .recent(Some(event_type), limit.min(MAX_LIST_LIMIT))
            .await
    }

    /// Verify an event's details against the hash taken when it was recorded
    pub async fn verify_integrity(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .get(id)
            .await?
            .map(|event| compute_details_hash(&event.details) == event.details_hash)
            .unwrap_or(false))
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA256 hex digest of an uploaded document
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA256 of the event details, streamed straight into the hasher
pub fn compute_details_hash(details: &Value) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), details).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
