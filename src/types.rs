//! Data model shared by the store, the transport and the processor.
//!
//! Ownership and checkpoint records serialize with camelCase field names so
//! that processors written against other SDKs can share one store.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{
    ENQUEUED_TIME_ANNOTATION, OFFSET_ANNOTATION, PARTITION_KEY_ANNOTATION,
    SEQUENCE_NUMBER_ANNOTATION,
};
use crate::error::ReceiveError;

// =============================================================================
// Store Records
// =============================================================================

/// Last known owner of one partition.
///
/// `etag` is the store's concurrency token. A request without one asks the
/// store to create the record; a request with one asks it to overwrite only
/// if the stored token still matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionOwnership {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    pub owner_id: String,
    /// Milliseconds since the Unix epoch, stamped by the store.
    pub last_modified_time: i64,
    pub etag: Option<String>,
}

impl PartitionOwnership {
    /// Whether the record was last renewed longer than `expiration_ms` before `now_ms`.
    #[inline]
    pub fn is_expired(&self, now_ms: i64, expiration_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_modified_time) > expiration_ms
    }

    pub fn partition_context(&self) -> PartitionContext {
        PartitionContext::new(
            &self.fully_qualified_namespace,
            &self.event_hub_name,
            &self.consumer_group,
            &self.partition_id,
        )
    }
}

/// Durable position marker for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    pub offset: Option<i64>,
    pub sequence_number: Option<i64>,
}

impl Checkpoint {
    /// Position just after this checkpoint, if it holds one.
    ///
    /// Offset wins over sequence number when both are present.
    pub fn resume_position(&self) -> Option<EventPosition> {
        match (self.offset, self.sequence_number) {
            (Some(offset), _) => Some(EventPosition::from_offset(offset, false)),
            (None, Some(sequence_number)) => {
                Some(EventPosition::from_sequence_number(sequence_number, false))
            }
            (None, None) => None,
        }
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Identity of the partition a callback is running for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionContext {
    pub fully_qualified_namespace: String,
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
}

impl PartitionContext {
    pub fn new(
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
        partition_id: &str,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.to_string(),
            event_hub_name: event_hub_name.to_string(),
            consumer_group: consumer_group.to_string(),
            partition_id: partition_id.to_string(),
        }
    }

    /// Context for errors that are not tied to a partition (load balancing).
    pub fn processor_level(
        fully_qualified_namespace: &str,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Self {
        Self::new(fully_qualified_namespace, event_hub_name, consumer_group, "")
    }

    #[inline]
    pub fn is_processor_level(&self) -> bool {
        self.partition_id.is_empty()
    }

    pub fn checkpoint(&self, offset: Option<i64>, sequence_number: Option<i64>) -> Checkpoint {
        Checkpoint {
            fully_qualified_namespace: self.fully_qualified_namespace.clone(),
            event_hub_name: self.event_hub_name.clone(),
            consumer_group: self.consumer_group.clone(),
            partition_id: self.partition_id.clone(),
            offset,
            sequence_number,
        }
    }
}

impl fmt::Display for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.event_hub_name, self.consumer_group, self.partition_id
        )
    }
}

/// Orders partition ids numerically when both parse as integers.
///
/// Numeric ids sort before non-numeric ones; non-numeric ids compare lexically.
pub fn compare_partition_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

// =============================================================================
// Positions
// =============================================================================

/// Where a receive link starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventPosition {
    /// Oldest event still retained.
    #[default]
    Earliest,
    /// Only events enqueued after the link opens.
    Latest,
    Offset { offset: i64, inclusive: bool },
    SequenceNumber { sequence_number: i64, inclusive: bool },
    EnqueuedTime(DateTime<Utc>),
}

impl EventPosition {
    #[inline]
    pub const fn from_offset(offset: i64, inclusive: bool) -> Self {
        EventPosition::Offset { offset, inclusive }
    }

    #[inline]
    pub const fn from_sequence_number(sequence_number: i64, inclusive: bool) -> Self {
        EventPosition::SequenceNumber {
            sequence_number,
            inclusive,
        }
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPosition::Earliest => write!(f, "earliest"),
            EventPosition::Latest => write!(f, "latest"),
            EventPosition::Offset { offset, inclusive } => {
                write!(f, "offset {}{}", if *inclusive { ">=" } else { ">" }, offset)
            }
            EventPosition::SequenceNumber {
                sequence_number,
                inclusive,
            } => write!(
                f,
                "sequence number {}{}",
                if *inclusive { ">=" } else { ">" },
                sequence_number
            ),
            EventPosition::EnqueuedTime(t) => write!(f, "enqueued at {}", t.to_rfc3339()),
        }
    }
}

impl std::str::FromStr for EventPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "earliest" => Ok(EventPosition::Earliest),
            "latest" => Ok(EventPosition::Latest),
            other => Err(format!(
                "unknown initial position '{}', expected 'earliest' or 'latest'",
                other
            )),
        }
    }
}

// =============================================================================
// Messages and Events
// =============================================================================

/// Raw message as handed over by a receive link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkMessage {
    pub body: Bytes,
    pub application_properties: HashMap<String, String>,
    pub message_annotations: HashMap<String, String>,
}

impl LinkMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_annotation(mut self, key: &str, value: impl ToString) -> Self {
        self.message_annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, value: impl ToString) -> Self {
        self.application_properties
            .insert(key.to_string(), value.to_string());
        self
    }
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub body: Bytes,
    pub properties: HashMap<String, String>,
    pub sequence_number: i64,
    pub offset: i64,
    pub enqueued_time: Option<DateTime<Utc>>,
    pub partition_key: Option<String>,
}

impl EventData {
    /// Decode the system annotations of a link message.
    ///
    /// Sequence number and offset are mandatory; enqueued time and partition
    /// key are optional.
    pub fn from_message(message: LinkMessage) -> Result<Self, ReceiveError> {
        let annotations = &message.message_annotations;
        let sequence_number = parse_required(annotations, SEQUENCE_NUMBER_ANNOTATION)?;
        let offset = parse_required(annotations, OFFSET_ANNOTATION)?;

        let enqueued_time = match annotations.get(ENQUEUED_TIME_ANNOTATION) {
            Some(raw) => {
                let millis = raw.parse::<i64>().map_err(|e| {
                    ReceiveError::Transform(format!(
                        "{} '{}' is not a timestamp: {}",
                        ENQUEUED_TIME_ANNOTATION, raw, e
                    ))
                })?;
                Utc.timestamp_millis_opt(millis).single()
            }
            None => None,
        };
        let partition_key = annotations.get(PARTITION_KEY_ANNOTATION).cloned();

        Ok(Self {
            body: message.body,
            properties: message.application_properties,
            sequence_number,
            offset,
            enqueued_time,
            partition_key,
        })
    }

    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

fn parse_required(annotations: &HashMap<String, String>, key: &str) -> Result<i64, ReceiveError> {
    let raw = annotations
        .get(key)
        .ok_or_else(|| ReceiveError::Transform(format!("missing {} annotation", key)))?;
    raw.parse::<i64>().map_err(|e| {
        ReceiveError::Transform(format!("{} '{}' is not an integer: {}", key, raw, e))
    })
}

/// Snapshot of the newest event in a partition, reported by the service when
/// tracking is enabled on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastEnqueuedEventProperties {
    pub sequence_number: Option<i64>,
    pub offset: Option<i64>,
    pub enqueued_time: Option<DateTime<Utc>>,
}

/// An event together with the partition it came from.
#[derive(Debug, Clone)]
pub struct PartitionEvent {
    pub partition_context: PartitionContext,
    pub data: EventData,
    pub last_enqueued: Option<LastEnqueuedEventProperties>,
}
