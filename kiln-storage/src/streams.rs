//! Bounded, TTL-expiring event streams shared across processes.
//!
//! Used for operation history, active-operation sets, detected issues and
//! profiling snapshots. Each stream is a store-side list: appends evict the
//! oldest events past the stream's bound and refresh its inactivity TTL.
//! When the external store is down the client's in-process fallback serves
//! as the bounded buffer.

use chrono::Utc;
use kiln_core::{new_token, KilnConfig, StoreError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::client::SharedStateClient;
use crate::store::StoreResult;

/// Stream families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    OperationHistory,
    ActiveOperations,
    DetectedIssues,
    ProfilingSnapshots,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::OperationHistory,
        StreamKind::ActiveOperations,
        StreamKind::DetectedIssues,
        StreamKind::ProfilingSnapshots,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::OperationHistory => "operation_history",
            StreamKind::ActiveOperations => "active_operations",
            StreamKind::DetectedIssues => "detected_issues",
            StreamKind::ProfilingSnapshots => "profiling_snapshots",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical stream: a family plus the scope it belongs to (job id, part id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamName {
    kind: StreamKind,
    scope_id: String,
}

impl StreamName {
    pub fn new(kind: StreamKind, scope_id: impl Into<String>) -> Self {
        Self {
            kind,
            scope_id: scope_id.into(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.scope_id)
    }
}

/// Bounds applied to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    /// Events kept; older ones are evicted first.
    pub max_events: usize,
    /// Whole-stream lifetime after the last append.
    pub ttl: Duration,
}

impl StreamLimits {
    pub fn new(max_events: usize, ttl: Duration) -> Self {
        Self { max_events, ttl }
    }
}

/// One event in a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub inserted_at: Timestamp,
}

/// Append-mostly shared collections.
#[derive(Debug, Clone)]
pub struct SharedStateStore {
    client: Arc<SharedStateClient>,
    default_limits: StreamLimits,
    limits: HashMap<StreamKind, StreamLimits>,
}

impl SharedStateStore {
    /// Streams bounded by the configured defaults.
    pub fn new(client: Arc<SharedStateClient>, config: &KilnConfig) -> Self {
        Self {
            client,
            default_limits: StreamLimits::new(config.stream_max_events, config.stream_ttl),
            limits: HashMap::new(),
        }
    }

    /// Override the bounds for one stream family.
    pub fn with_limits(mut self, kind: StreamKind, limits: StreamLimits) -> Self {
        self.limits.insert(kind, limits);
        self
    }

    /// Bounds in effect for `kind`.
    pub fn limits_for(&self, kind: StreamKind) -> StreamLimits {
        self.limits.get(&kind).copied().unwrap_or(self.default_limits)
    }

    /// Whether appends are currently landing in the in-process buffer only.
    pub fn is_degraded(&self) -> bool {
        self.client.is_degraded()
    }

    pub fn client(&self) -> &Arc<SharedStateClient> {
        &self.client
    }

    /// Append an event, evicting the oldest past the stream's bound.
    pub async fn append_event(
        &self,
        stream: &StreamName,
        payload: serde_json::Value,
    ) -> StoreResult<StreamEvent> {
        let event = StreamEvent {
            id: new_token(),
            payload,
            inserted_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&event).map_err(|e| StoreError::Corrupt {
            backend: self.client.backend_name().to_string(),
            key: stream.to_string(),
            reason: e.to_string(),
        })?;
        let limits = self.limits_for(stream.kind());
        self.client
            .append_bounded(&self.key(stream), &bytes, limits.max_events, limits.ttl)
            .await?;
        Ok(event)
    }

    /// All retained events, oldest first.
    ///
    /// Events that fail to decode (written by an incompatible version) are
    /// skipped.
    pub async fn read_events(&self, stream: &StreamName) -> StoreResult<Vec<StreamEvent>> {
        let raw = self.client.list_all(&self.key(stream)).await?;
        let mut events = Vec::with_capacity(raw.len());
        for bytes in raw {
            match serde_json::from_slice::<StreamEvent>(&bytes) {
                Ok(event) => events.push(event),
                Err(e) => warn!(stream = %stream, error = %e, "Skipping undecodable stream event"),
            }
        }
        Ok(events)
    }

    /// Delete a stream. Returns whether it existed.
    pub async fn drop_stream(&self, stream: &StreamName) -> StoreResult<bool> {
        self.client.delete(&self.key(stream)).await
    }

    fn key(&self, stream: &StreamName) -> String {
        self.client.namespaced("stream", &stream.to_string())
    }
}
