//! Pipeline events and the broadcast bus that carries them
//!
//! Events are informational: the pipeline never depends on a subscriber
//! being present. The HTTP layer forwards them to SSE clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Upload/import lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Transfer finished and raw rows were written to the row store
    UploadStored {
        upload_id: Uuid,
        importer_id: Uuid,
        num_rows: u64,
        timestamp: DateTime<Utc>,
    },

    /// Header row chosen and upload columns derived
    HeaderRowSelected {
        upload_id: Uuid,
        header_row_index: u64,
        num_columns: usize,
        timestamp: DateTime<Utc>,
    },

    /// Materialization claimed and launched for an upload
    MaterializationStarted {
        upload_id: Uuid,
        import_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Periodic progress while rows are being validated
    MaterializationProgress {
        upload_id: Uuid,
        import_id: Uuid,
        rows_processed: u64,
        rows_total: u64,
        timestamp: DateTime<Utc>,
    },

    /// Import stored with final counters
    MaterializationCompleted {
        upload_id: Uuid,
        import_id: Uuid,
        num_rows: u64,
        num_valid_rows: u64,
        num_error_rows: u64,
        timestamp: DateTime<Utc>,
    },

    /// Materialization stopped with a terminal error
    MaterializationFailed {
        upload_id: Uuid,
        import_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Import handed back to the integrating application
    ImportSubmitted {
        upload_id: Uuid,
        import_id: Uuid,
        rows_inline: bool,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::UploadStored { .. } => "UploadStored",
            PipelineEvent::HeaderRowSelected { .. } => "HeaderRowSelected",
            PipelineEvent::MaterializationStarted { .. } => "MaterializationStarted",
            PipelineEvent::MaterializationProgress { .. } => "MaterializationProgress",
            PipelineEvent::MaterializationCompleted { .. } => "MaterializationCompleted",
            PipelineEvent::MaterializationFailed { .. } => "MaterializationFailed",
            PipelineEvent::ImportSubmitted { .. } => "ImportSubmitted",
        }
    }

    /// Upload the event belongs to
    pub fn upload_id(&self) -> Uuid {
        match self {
            PipelineEvent::UploadStored { upload_id, .. }
            | PipelineEvent::HeaderRowSelected { upload_id, .. }
            | PipelineEvent::MaterializationStarted { upload_id, .. }
            | PipelineEvent::MaterializationProgress { upload_id, .. }
            | PipelineEvent::MaterializationCompleted { upload_id, .. }
            | PipelineEvent::MaterializationFailed { upload_id, .. }
            | PipelineEvent::ImportSubmitted { upload_id, .. } => *upload_id,
        }
    }
}

/// Broadcast bus for pipeline events
///
/// Cloning is cheap; all clones share one channel.
///
/// # Examples
///
/// ```
/// use tabflow_common::events::EventBus;
///
/// let bus = EventBus::new(100);
/// let _rx = bus.subscribe();
/// assert_eq!(bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
