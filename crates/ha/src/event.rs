//! Replication data model
//!
//! Lifecycle events as seen by the HA listener, and the self-contained
//! [`ReplicationRecord`] that is written to the shared store.
//!
//! # Store Layout
//!
//! ```text
//! sa:{sa_id}:{sequence}  ->  JSON ReplicationRecord
//! ```
//!
//! For a fixed `sa_id`, sequences start at 1 and are assigned in the order
//! events were observed. Gaps are possible (admission eviction), but an
//! earlier sequence is never written after a later one.

use crate::bus::{AuthMethod, IkeSaState};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every key written to the shared store
pub const KEY_PREFIX: &str = "sa";

/// Build the store key for one record
pub fn store_key(sa: SaIdentifier, sequence: u64) -> String {
    format!("{}:{}:{}", KEY_PREFIX, sa, sequence)
}

/// Stable identifier of one IKE SA instance
///
/// Wraps the engine's unique SA id. A rekey produces a new identifier
/// rather than mutating the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaIdentifier(u32);

impl SaIdentifier {
    /// Reserved stream for node-scoped diagnostics (alerts without an SA).
    ///
    /// Engine unique ids start at 1, so 0 never collides with a real SA.
    pub const NODE: SaIdentifier = SaIdentifier(0);

    /// Wrap an engine unique id
    pub const fn new(id: u32) -> Self {
        SaIdentifier(id)
    }

    /// Raw engine id
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Whether this is the node-scoped diagnostics stream
    pub fn is_node(self) -> bool {
        self == Self::NODE
    }
}

impl fmt::Display for SaIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SaIdentifier {
    fn from(id: u32) -> Self {
        SaIdentifier(id)
    }
}

/// Direction of an observed IKE message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Received from the peer
    #[serde(rename = "in")]
    Inbound,
    /// Sent to the peer
    #[serde(rename = "out")]
    Outbound,
}

impl Direction {
    /// Direction from the engine's `incoming` flag
    pub fn from_incoming(incoming: bool) -> Self {
        if incoming {
            Direction::Inbound
        } else {
            Direction::Outbound
        }
    }
}

/// Local role in the IKE negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    /// We sent IKE_SA_INIT
    Initiator,
    /// The peer sent IKE_SA_INIT
    Responder,
}

/// Opaque reference to derived key material
///
/// Cleartext keys never appear here. `Debug` is redacted so the reference
/// is safe to put in log fields.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyMaterialRef {
    /// Handle into the engine's own keymat storage
    Handle {
        /// Engine handle
        id: u64,
    },

    /// AES-256-GCM sealed blob, hex encoded
    Sealed {
        /// 96-bit nonce
        nonce: String,
        /// Ciphertext with tag appended
        ciphertext: String,
    },

    /// No way to reference the keys without exposing them
    Withheld,
}

impl fmt::Debug for KeyMaterialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterialRef::Handle { id } => write!(f, "Handle({})", id),
            KeyMaterialRef::Sealed { ciphertext, .. } => {
                write!(f, "Sealed(<{} bytes>)", ciphertext.len() / 2)
            }
            KeyMaterialRef::Withheld => write!(f, "Withheld"),
        }
    }
}

/// SA lifecycle event observed on the engine bus
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Non-fatal diagnostic raised during negotiation
    Alert {
        /// SA the alert concerns, if any
        sa: Option<SaIdentifier>,
        /// Engine alert code
        code: u32,
        /// Human readable context
        context: String,
    },

    /// Keying material became available
    KeysDerived {
        /// SA the keys belong to
        sa: SaIdentifier,
        /// Opaque key reference
        key_material: KeyMaterialRef,
        /// Our role in the negotiation
        role: NegotiationRole,
        /// Authentication method negotiated
        auth_method: AuthMethod,
        /// SA being rekeyed, when keys derive from a rekey
        rekey_of: Option<SaIdentifier>,
    },

    /// SA went up or down
    Established {
        /// SA
        sa: SaIdentifier,
        /// true = up
        up: bool,
    },

    /// `old` is being replaced by `new`
    Rekeyed {
        /// Replaced SA
        old: SaIdentifier,
        /// Replacement SA
        new: SaIdentifier,
    },

    /// Protocol state machine transition
    StateChanged {
        /// SA
        sa: SaIdentifier,
        /// State entered
        new_state: IkeSaState,
    },

    /// A protocol message crossed the wire
    MessageObserved {
        /// SA
        sa: SaIdentifier,
        /// in / out
        direction: Direction,
        /// Whether the message was seen before encryption / after decryption
        is_plaintext: bool,
        /// IKE exchange type
        exchange: u8,
        /// IKE message id
        message_id: u32,
    },

    /// Hook category this crate does not model
    Unrecognized {
        /// SA, if the engine supplied one
        sa: Option<SaIdentifier>,
        /// Engine name of the event
        name: String,
    },
}

impl LifecycleEvent {
    /// Stream the event is ordered on
    ///
    /// A rekey is recorded on the old SA so that its final record links to
    /// the replacement.
    pub fn sa(&self) -> SaIdentifier {
        match self {
            LifecycleEvent::Alert { sa, .. } | LifecycleEvent::Unrecognized { sa, .. } => {
                sa.unwrap_or(SaIdentifier::NODE)
            }
            LifecycleEvent::KeysDerived { sa, .. }
            | LifecycleEvent::Established { sa, .. }
            | LifecycleEvent::StateChanged { sa, .. }
            | LifecycleEvent::MessageObserved { sa, .. } => *sa,
            LifecycleEvent::Rekeyed { old, .. } => *old,
        }
    }

    /// Record kind this event encodes to
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Alert { .. } => EventKind::Alert,
            LifecycleEvent::KeysDerived { .. } => EventKind::KeysDerived,
            LifecycleEvent::Established { .. } => EventKind::Established,
            LifecycleEvent::Rekeyed { .. } => EventKind::Rekeyed,
            LifecycleEvent::StateChanged { .. } => EventKind::StateChanged,
            LifecycleEvent::MessageObserved { .. } => EventKind::MessageObserved,
            LifecycleEvent::Unrecognized { .. } => EventKind::Observed,
        }
    }

    /// Whether this is the last event the engine emits for the SA
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::StateChanged {
                new_state: IkeSaState::Destroying,
                ..
            }
        )
    }
}

/// Kind tag carried by every stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Diagnostic alert
    Alert,
    /// Keys derived
    KeysDerived,
    /// Up / down
    Established,
    /// Rekey link
    Rekeyed,
    /// State transition
    StateChanged,
    /// Message liveness
    MessageObserved,
    /// Generic record for anything that could not be encoded specifically
    Observed,
}

impl EventKind {
    /// Retention priority under admission pressure
    pub fn priority(self) -> Priority {
        match self {
            EventKind::KeysDerived | EventKind::Established | EventKind::Rekeyed => {
                Priority::Critical
            }
            EventKind::StateChanged => Priority::Transition,
            EventKind::Alert | EventKind::MessageObserved | EventKind::Observed => {
                Priority::Diagnostic
            }
        }
    }

    /// Short name used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Alert => "alert",
            EventKind::KeysDerived => "keys_derived",
            EventKind::Established => "established",
            EventKind::Rekeyed => "rekeyed",
            EventKind::StateChanged => "state_changed",
            EventKind::MessageObserved => "message_observed",
            EventKind::Observed => "observed",
        }
    }
}

/// Retention priority, lowest first
///
/// Takeover needs `Critical` records; the others only add freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Liveness and diagnostics
    Diagnostic,
    /// Intermediate state transitions
    Transition,
    /// Keys, up/down and rekey links
    Critical,
}

impl Priority {
    /// Whether records of this class may be evicted before critical ones
    pub fn is_loss_tolerant(self) -> bool {
        self < Priority::Critical
    }
}

/// Unit of replication stored under `sa:{sa_id}:{sequence}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    /// SA stream
    pub sa_id: SaIdentifier,
    /// Per-SA sequence number, starting at 1
    pub sequence: u64,
    /// Kind tag
    pub event_kind: EventKind,
    /// Kind-specific fields
    pub payload: serde_json::Value,
    /// Node that observed the event
    pub origin_node_id: String,
}

impl ReplicationRecord {
    /// Key this record is stored under
    pub fn store_key(&self) -> String {
        store_key(self.sa_id, self.sequence)
    }

    /// Retention priority
    pub fn priority(&self) -> Priority {
        self.event_kind.priority()
    }

    /// Serialize to the store value format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    /// Parse a store value
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }
}
