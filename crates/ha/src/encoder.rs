//! Event encoder
//!
//! Turns a [`LifecycleEvent`] into a self-contained [`ReplicationRecord`].
//! Encoding performs no I/O and holds no locks, so it is safe on any thread.
//!
//! # Payloads
//!
//! | kind               | payload fields                                        |
//! |--------------------|-------------------------------------------------------|
//! | `alert`            | `code`, `context`                                     |
//! | `keys_derived`     | `key_material`, `role`, `auth_method`, `rekey_of`     |
//! | `established`      | `up`                                                  |
//! | `rekeyed`          | `new_sa`                                              |
//! | `state_changed`    | `state`                                               |
//! | `message_observed` | `direction`, `plaintext`, `exchange`, `message_id`    |
//! | `observed`         | `name` or `source_kind` + `error`                     |

use crate::event::{EventKind, LifecycleEvent, ReplicationRecord, SaIdentifier};
use crate::Result;
use serde_json::{json, Value};

/// Stateless encoder stamping records with the local node id
#[derive(Debug, Clone)]
pub struct EventEncoder {
    origin_node_id: String,
}

impl EventEncoder {
    /// Create an encoder for the given node
    pub fn new(origin_node_id: impl Into<String>) -> Self {
        Self {
            origin_node_id: origin_node_id.into(),
        }
    }

    /// Node id written into every record
    pub fn origin_node_id(&self) -> &str {
        &self.origin_node_id
    }

    /// Encode one event
    ///
    /// Never fails: anything that cannot be encoded specifically becomes an
    /// `Observed` record so consumers can still see that something happened.
    pub fn encode(&self, event: &LifecycleEvent, sequence: u64) -> ReplicationRecord {
        let sa_id = event.sa();
        match payload(event) {
            Ok(payload) => self.record(sa_id, sequence, event.kind(), payload),
            Err(e) => self.record(
                sa_id,
                sequence,
                EventKind::Observed,
                json!({
                    "source_kind": event.kind().as_str(),
                    "error": e.to_string(),
                }),
            ),
        }
    }

    fn record(
        &self,
        sa_id: SaIdentifier,
        sequence: u64,
        event_kind: EventKind,
        payload: Value,
    ) -> ReplicationRecord {
        ReplicationRecord {
            sa_id,
            sequence,
            event_kind,
            payload,
            origin_node_id: self.origin_node_id.clone(),
        }
    }
}

fn payload(event: &LifecycleEvent) -> Result<Value> {
    let value = match event {
        LifecycleEvent::Alert { code, context, .. } => json!({
            "code": code,
            "context": context,
        }),
        LifecycleEvent::KeysDerived {
            key_material,
            role,
            auth_method,
            rekey_of,
            ..
        } => json!({
            "key_material": serde_json::to_value(key_material)?,
            "role": role,
            "auth_method": auth_method,
            "rekey_of": rekey_of,
        }),
        LifecycleEvent::Established { up, .. } => json!({ "up": up }),
        LifecycleEvent::Rekeyed { new, .. } => json!({ "new_sa": new }),
        LifecycleEvent::StateChanged { new_state, .. } => json!({ "state": new_state }),
        LifecycleEvent::MessageObserved {
            direction,
            is_plaintext,
            exchange,
            message_id,
            ..
        } => json!({
            "direction": direction,
            "plaintext": is_plaintext,
            "exchange": exchange,
            "message_id": message_id,
        }),
        LifecycleEvent::Unrecognized { name, .. } => json!({ "name": name }),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{AuthMethod, IkeSaState};
    use crate::event::{Direction, KeyMaterialRef, NegotiationRole};

    fn encoder() -> EventEncoder {
        EventEncoder::new("gw-a")
    }

    #[test]
    fn test_encode_established() {
        let event = LifecycleEvent::Established {
            sa: SaIdentifier::new(1),
            up: true,
        };
        let record = encoder().encode(&event, 1);

        assert_eq!(record.sa_id, SaIdentifier::new(1));
        assert_eq!(record.sequence, 1);
        assert_eq!(record.event_kind, EventKind::Established);
        assert_eq!(record.payload["up"], true);
        assert_eq!(record.origin_node_id, "gw-a");
    }

    #[test]
    fn test_encode_rekey_links_new_sa() {
        let event = LifecycleEvent::Rekeyed {
            old: SaIdentifier::new(1),
            new: SaIdentifier::new(2),
        };
        let record = encoder().encode(&event, 3);

        assert_eq!(record.sa_id, SaIdentifier::new(1));
        assert_eq!(record.event_kind, EventKind::Rekeyed);
        assert_eq!(record.payload["new_sa"], 2);
        assert_eq!(record.store_key(), "sa:1:3");
    }

    #[test]
    fn test_encode_state_change() {
        let event = LifecycleEvent::StateChanged {
            sa: SaIdentifier::new(8),
            new_state: IkeSaState::Rekeying,
        };
        let record = encoder().encode(&event, 4);

        assert_eq!(record.event_kind, EventKind::StateChanged);
        assert_eq!(record.payload["state"], "rekeying");
    }

    #[test]
    fn test_encode_message() {
        let event = LifecycleEvent::MessageObserved {
            sa: SaIdentifier::new(8),
            direction: Direction::Inbound,
            is_plaintext: false,
            exchange: 37,
            message_id: 12,
        };
        let record = encoder().encode(&event, 2);

        assert_eq!(record.payload["direction"], "in");
        assert_eq!(record.payload["plaintext"], false);
        assert_eq!(record.payload["exchange"], 37);
    }

    #[test]
    fn test_encode_keys_is_opaque() {
        let event = LifecycleEvent::KeysDerived {
            sa: SaIdentifier::new(4),
            key_material: KeyMaterialRef::Handle { id: 77 },
            role: NegotiationRole::Responder,
            auth_method: AuthMethod::Psk,
            rekey_of: None,
        };
        let record = encoder().encode(&event, 1);

        assert_eq!(record.event_kind, EventKind::KeysDerived);
        assert_eq!(record.payload["key_material"]["type"], "handle");
        assert_eq!(record.payload["key_material"]["id"], 77);
        assert_eq!(record.payload["role"], "responder");
        assert!(record.payload["rekey_of"].is_null());
    }

    #[test]
    fn test_unrecognized_becomes_observed() {
        let event = LifecycleEvent::Unrecognized {
            sa: Some(SaIdentifier::new(6)),
            name: "child_updown".into(),
        };
        let record = encoder().encode(&event, 9);

        assert_eq!(record.event_kind, EventKind::Observed);
        assert_eq!(record.sa_id, SaIdentifier::new(6));
        assert_eq!(record.payload["name"], "child_updown");
    }

    #[test]
    fn test_node_alert() {
        let event = LifecycleEvent::Alert {
            sa: None,
            code: 21,
            context: "retransmit limit".into(),
        };
        let record = encoder().encode(&event, 1);

        assert_eq!(record.sa_id, SaIdentifier::NODE);
        assert_eq!(record.event_kind, EventKind::Alert);
        assert_eq!(record.payload["code"], 21);
    }
}
