//! Negotiation engine bus surface
//!
//! The IKE daemon owns SA objects and runs the protocol state machine. It
//! publishes lifecycle notifications to registered [`BusListener`]s from its
//! worker threads. This module defines the slice of that surface the HA
//! subsystem consumes, plus [`Bus`], a minimal in-process implementation
//! used by embedders without their own bus and by tests.
//!
//! # IKE SA States
//!
//! ```text
//! CREATED
//!   ↓ (initiate / receive IKE_SA_INIT)
//! CONNECTING
//!   ↓ (IKE_AUTH complete)
//! ESTABLISHED ←→ REKEYING → REKEYED
//!   ↓
//! DELETING
//!   ↓
//! DESTROYING
//! ```
//!
//! `PASSIVE` is entered by SAs installed on a standby node.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

/// IKE SA state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IkeSaState {
    /// SA object created, nothing sent yet
    Created,
    /// Negotiation in progress
    Connecting,
    /// Authenticated and usable
    Established,
    /// Installed but not actively used (HA standby)
    Passive,
    /// Rekey exchange in progress
    Rekeying,
    /// Replaced by a rekeyed SA
    Rekeyed,
    /// Delete exchange in progress
    Deleting,
    /// About to be freed; no further events follow
    Destroying,
}

impl IkeSaState {
    /// Engine name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            IkeSaState::Created => "CREATED",
            IkeSaState::Connecting => "CONNECTING",
            IkeSaState::Established => "ESTABLISHED",
            IkeSaState::Passive => "PASSIVE",
            IkeSaState::Rekeying => "REKEYING",
            IkeSaState::Rekeyed => "REKEYED",
            IkeSaState::Deleting => "DELETING",
            IkeSaState::Destroying => "DESTROYING",
        }
    }
}

/// Authentication method negotiated for an IKE SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Pre-shared key
    Psk,
    /// RSA / ECDSA / EdDSA signature
    PublicKey,
    /// EAP
    Eap,
    /// Not authenticated yet (e.g. keys derived during IKE_SA_INIT)
    None,
}

/// Read-only view of an engine-owned IKE SA
///
/// Listeners must not hold on to the SA beyond the hook call; they copy
/// whatever they need.
pub trait IkeSa: Send + Sync {
    /// Engine unique id, stable for the SA lifetime; 0 is never valid
    fn unique_id(&self) -> u32;

    /// Whether we initiated the SA
    fn is_initiator(&self) -> bool;

    /// Connection name, for logs
    fn name(&self) -> &str;
}

/// Arguments of the key derivation hook
///
/// Borrowed secrets stay owned by the engine; a listener that needs to keep
/// them must seal or reference them, never copy them verbatim.
pub struct IkeKeys<'a> {
    /// Diffie-Hellman shared secret
    pub shared_secret: &'a [u8],
    /// Initiator nonce
    pub nonce_i: &'a [u8],
    /// Responder nonce
    pub nonce_r: &'a [u8],
    /// SA being rekeyed, if this derivation belongs to a rekey
    pub rekey: Option<&'a dyn IkeSa>,
    /// Authentication method
    pub auth_method: AuthMethod,
    /// Handle into engine keymat storage, when the engine keeps one
    pub keymat_handle: Option<u64>,
}

/// Header fields of an IKE message passing the message hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMeta {
    /// Exchange type (34 = IKE_SA_INIT, 35 = IKE_AUTH, ...)
    pub exchange: u8,
    /// Message id
    pub message_id: u32,
    /// Request or response
    pub is_request: bool,
}

/// Bus observer
///
/// Hooks run on engine worker threads, possibly concurrently. Returning
/// `false` unregisters the listener.
pub trait BusListener: Send + Sync {
    /// Alert raised, optionally bound to an SA
    fn alert(&self, _ike_sa: Option<&dyn IkeSa>, _code: u32, _context: &str) -> bool {
        true
    }

    /// IKE keys derived
    fn ike_keys(&self, _ike_sa: &dyn IkeSa, _keys: &IkeKeys<'_>) -> bool {
        true
    }

    /// IKE SA went up or down
    fn ike_updown(&self, _ike_sa: &dyn IkeSa, _up: bool) -> bool {
        true
    }

    /// `old` replaced by `new`
    fn ike_rekey(&self, _old: &dyn IkeSa, _new: &dyn IkeSa) -> bool {
        true
    }

    /// State machine transition
    fn ike_state_change(&self, _ike_sa: &dyn IkeSa, _new: IkeSaState) -> bool {
        true
    }

    /// IKE message sent or received
    fn message(
        &self,
        _ike_sa: &dyn IkeSa,
        _message: &MessageMeta,
        _incoming: bool,
        _plain: bool,
    ) -> bool {
        true
    }
}

/// Registration side of a bus
pub trait ListenerRegistry: Send + Sync {
    /// Register a listener
    fn add_listener(&self, listener: Arc<dyn BusListener>);

    /// Unregister a listener; returns whether it was registered
    fn remove_listener(&self, listener: &Arc<dyn BusListener>) -> bool;
}

fn same_listener(a: &Arc<dyn BusListener>, b: &Arc<dyn BusListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Minimal in-process bus
#[derive(Default)]
pub struct Bus {
    listeners: RwLock<Vec<Arc<dyn BusListener>>>,
}

impl Bus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Raise an alert
    pub fn alert(&self, ike_sa: Option<&dyn IkeSa>, code: u32, context: &str) {
        self.each(|l| l.alert(ike_sa, code, context));
    }

    /// Report derived keys
    pub fn ike_keys(&self, ike_sa: &dyn IkeSa, keys: &IkeKeys<'_>) {
        self.each(|l| l.ike_keys(ike_sa, keys));
    }

    /// Report up / down
    pub fn ike_updown(&self, ike_sa: &dyn IkeSa, up: bool) {
        self.each(|l| l.ike_updown(ike_sa, up));
    }

    /// Report a rekey
    pub fn ike_rekey(&self, old: &dyn IkeSa, new: &dyn IkeSa) {
        self.each(|l| l.ike_rekey(old, new));
    }

    /// Report a state transition
    pub fn ike_state_change(&self, ike_sa: &dyn IkeSa, new: IkeSaState) {
        self.each(|l| l.ike_state_change(ike_sa, new));
    }

    /// Report a message
    pub fn message(&self, ike_sa: &dyn IkeSa, message: &MessageMeta, incoming: bool, plain: bool) {
        self.each(|l| l.message(ike_sa, message, incoming, plain));
    }

    // Listeners are invoked without the lock held so a hook may
    // (un)register listeners.
    fn each(&self, mut hook: impl FnMut(&dyn BusListener) -> bool) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let dropped: Vec<_> = listeners
            .iter()
            .filter(|l| !hook(&***l))
            .cloned()
            .collect();

        if !dropped.is_empty() {
            self.listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|l| !dropped.iter().any(|d| same_listener(l, d)));
        }
    }
}

impl ListenerRegistry for Bus {
    fn add_listener(&self, listener: Arc<dyn BusListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn BusListener>) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }
}
