// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue events, batches and control-event decoding.
//!
//! Everything a node reads from its provider is an [`Event`]. Events whose
//! `ev_type` carries the `pgq.` prefix are control events describing
//! topology changes; the rest are business events for the handler.
//!
//! # Wire Format
//!
//! ```text
//! ev_type               ev_data (JSON)
//! pgq.node-created      {"node_name": "b1", "node_type": "branch", ...}
//! pgq.node-dropped      {"node": "r", "replacement": "r2"}
//! pgq.provider-switch   {"node": "b1", "old": "p1", "new": "p2"}
//! pgq.member-update     {"combined_queue": "cq", "members": ["b1", "b2"]}
//! pgq.tag-switch        {"node": "b1", "old_worker": "w1", "new_worker": "w2"}
//! pgq.pause             {"node": "b1"}
//! pgq.resume            {"node": "b1"}
//! pgq.watermark         {"node": "b1", "watermark": 42}
//! ```
//!
//! An unknown `pgq.*` suffix decodes to [`ControlEvent::Ignored`] so newer
//! producers do not break older consumers. A known kind with a payload that
//! does not parse is a [`CascadeError::BadControlEvent`].

use crate::error::{CascadeError, Result};
use crate::topology::{Node, Tick};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Prefix marking control events in `ev_type`.
pub const CONTROL_PREFIX: &str = "pgq.";

/// One event as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub ev_id: u64,
    pub ev_type: String,
    #[serde(default)]
    pub ev_data: String,
    #[serde(default)]
    pub ev_extra1: Option<String>,
    #[serde(default)]
    pub ev_extra2: Option<String>,
    #[serde(default)]
    pub ev_extra3: Option<String>,
    #[serde(default)]
    pub ev_extra4: Option<String>,
}

impl Event {
    pub fn new(ev_id: u64, ev_type: impl Into<String>, ev_data: impl Into<String>) -> Self {
        Self {
            ev_id,
            ev_type: ev_type.into(),
            ev_data: ev_data.into(),
            ev_extra1: None,
            ev_extra2: None,
            ev_extra3: None,
            ev_extra4: None,
        }
    }

    /// Build a control event from a typed payload.
    pub fn control(ev_id: u64, event: &ControlEvent) -> Self {
        Self::new(ev_id, format!("{CONTROL_PREFIX}{}", event.kind()), event.payload())
    }

    pub fn is_control(&self) -> bool {
        self.ev_type.starts_with(CONTROL_PREFIX)
    }
}

/// A contiguous range of events between two ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub batch_id: u64,
    /// Tick the batch starts after.
    pub prev_tick: Tick,
    /// Tick the batch ends on; the consumer's position after commit.
    pub tick: Tick,
    pub events: Vec<Event>,
}

impl Batch {
    /// Split into control and business events, each keeping arrival order.
    pub fn partition(&self) -> (Vec<&Event>, Vec<&Event>) {
        self.events.iter().partition(|e| e.is_control())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDropped {
    pub node: String,
    #[serde(default)]
    pub replacement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSwitch {
    pub node: String,
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub combined_queue: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSwitch {
    pub node: String,
    pub old_worker: String,
    pub new_worker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkReport {
    pub node: String,
    pub watermark: Tick,
}

/// Decoded control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    NodeCreated(Node),
    NodeDropped(NodeDropped),
    ProviderSwitch(ProviderSwitch),
    MemberUpdate(MemberUpdate),
    TagSwitch(TagSwitch),
    Pause(NodeRef),
    Resume(NodeRef),
    Watermark(WatermarkReport),
    /// Unrecognised kind, kept for logging.
    Ignored { kind: String },
}

impl ControlEvent {
    /// Decode a queue event. Returns `Ok(None)` for business events.
    pub fn decode(event: &Event) -> Result<Option<Self>> {
        let Some(kind) = event.ev_type.strip_prefix(CONTROL_PREFIX) else {
            return Ok(None);
        };
        let parsed = match kind {
            "node-created" => Self::NodeCreated(parse(kind, event)?),
            "node-dropped" => Self::NodeDropped(parse(kind, event)?),
            "provider-switch" => Self::ProviderSwitch(parse(kind, event)?),
            "member-update" => Self::MemberUpdate(parse(kind, event)?),
            "tag-switch" => Self::TagSwitch(parse(kind, event)?),
            "pause" => Self::Pause(parse(kind, event)?),
            "resume" => Self::Resume(parse(kind, event)?),
            "watermark" => Self::Watermark(parse(kind, event)?),
            other => Self::Ignored {
                kind: other.to_string(),
            },
        };
        Ok(Some(parsed))
    }

    /// Kind suffix used in `ev_type`.
    pub fn kind(&self) -> &str {
        match self {
            Self::NodeCreated(_) => "node-created",
            Self::NodeDropped(_) => "node-dropped",
            Self::ProviderSwitch(_) => "provider-switch",
            Self::MemberUpdate(_) => "member-update",
            Self::TagSwitch(_) => "tag-switch",
            Self::Pause(_) => "pause",
            Self::Resume(_) => "resume",
            Self::Watermark(_) => "watermark",
            Self::Ignored { kind } => kind,
        }
    }

    /// JSON payload for `ev_data`.
    pub fn payload(&self) -> String {
        let value = match self {
            Self::NodeCreated(n) => serde_json::to_string(n),
            Self::NodeDropped(p) => serde_json::to_string(p),
            Self::ProviderSwitch(p) => serde_json::to_string(p),
            Self::MemberUpdate(p) => serde_json::to_string(p),
            Self::TagSwitch(p) => serde_json::to_string(p),
            Self::Pause(p) | Self::Resume(p) => serde_json::to_string(p),
            Self::Watermark(p) => serde_json::to_string(p),
            Self::Ignored { .. } => Ok(String::new()),
        };
        // Plain structs of strings and integers always serialize.
        value.unwrap_or_default()
    }
}

fn parse<T: DeserializeOwned>(kind: &str, event: &Event) -> Result<T> {
    serde_json::from_str(&event.ev_data).map_err(|e| CascadeError::BadControlEvent {
        kind: kind.to_string(),
        event_id: event.ev_id,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeType;

    #[test]
    fn test_business_event_is_not_control() {
        let ev = Event::new(1, "order.created", "{}");
        assert!(!ev.is_control());
        assert_eq!(ControlEvent::decode(&ev).unwrap(), None);
    }

    #[test]
    fn test_decode_provider_switch() {
        let ev = Event::new(
            7,
            "pgq.provider-switch",
            r#"{"node":"b1","old":"p1","new":"p2"}"#,
        );
        let decoded = ControlEvent::decode(&ev).unwrap().unwrap();
        assert_eq!(
            decoded,
            ControlEvent::ProviderSwitch(ProviderSwitch {
                node: "b1".into(),
                old: "p1".into(),
                new: "p2".into(),
            })
        );
    }

    #[test]
    fn test_decode_node_created_defaults() {
        let ev = Event::new(
            3,
            "pgq.node-created",
            r#"{"node_name":"leaf","node_type":"leaf","provider_node":"b1"}"#,
        );
        match ControlEvent::decode(&ev).unwrap().unwrap() {
            ControlEvent::NodeCreated(node) => {
                assert_eq!(node.node_type, NodeType::Leaf);
                assert_eq!(node.provider_node.as_deref(), Some("b1"));
                assert!(!node.is_paused);
                assert_eq!(node.watermark, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        let ev = Event::new(9, "pgq.location-info", "whatever");
        assert_eq!(
            ControlEvent::decode(&ev).unwrap(),
            Some(ControlEvent::Ignored {
                kind: "location-info".into()
            })
        );
    }

    #[test]
    fn test_malformed_payload_is_bad_control_event() {
        let ev = Event::new(11, "pgq.watermark", r#"{"node":"b1"}"#);
        match ControlEvent::decode(&ev) {
            Err(CascadeError::BadControlEvent { kind, event_id, .. }) => {
                assert_eq!(kind, "watermark");
                assert_eq!(event_id, 11);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_control_constructor_encodes_kind_and_payload() {
        let ce = ControlEvent::NodeDropped(NodeDropped {
            node: "r".into(),
            replacement: Some("r2".into()),
        });
        let ev = Event::control(5, &ce);
        assert_eq!(ev.ev_type, "pgq.node-dropped");
        assert_eq!(ControlEvent::decode(&ev).unwrap(), Some(ce));
    }

    #[test]
    fn test_partition_keeps_order() {
        let batch = Batch {
            batch_id: 1,
            prev_tick: 0,
            tick: 1,
            events: vec![
                Event::new(1, "a", ""),
                Event::new(2, "pgq.pause", r#"{"node":"x"}"#),
                Event::new(3, "b", ""),
                Event::new(4, "pgq.resume", r#"{"node":"x"}"#),
            ],
        };
        let (control, business) = batch.partition();
        assert_eq!(control.iter().map(|e| e.ev_id).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(business.iter().map(|e| e.ev_id).collect::<Vec<_>>(), vec![1, 3]);
    }
}
