//! HA bus listener
//!
//! Bridges the engine bus to the replication queue. Every hook:
//!
//! 1. identifies the SA and copies what it needs out of the borrowed
//!    arguments,
//! 2. encodes a [`ReplicationRecord`](crate::ReplicationRecord) under the
//!    queue lock (which assigns the per-SA sequence),
//! 3. returns `true`.
//!
//! No hook touches the network, waits on the store, or propagates an
//! error or a panic into the engine. Problems are reported through
//! [`HaMetrics`] and the [`logging`] functions only.

use crate::bus::{BusListener, IkeKeys, IkeSa, IkeSaState, MessageMeta};
use crate::encoder::EventEncoder;
use crate::event::{Direction, KeyMaterialRef, LifecycleEvent, NegotiationRole, SaIdentifier};
use crate::logging;
use crate::metrics::HaMetrics;
use crate::queue::{Admission, ReplicationQueue};
use crate::seal::{self, KeySealer};
use crate::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Bus listener feeding the replication queue
#[derive(Debug)]
pub struct HaListener {
    encoder: EventEncoder,
    queue: Arc<ReplicationQueue>,
    sealer: Option<KeySealer>,
    metrics: HaMetrics,
}

impl HaListener {
    /// Create a listener
    ///
    /// Without a `sealer`, derived keys are replicated as
    /// [`KeyMaterialRef::Withheld`] unless the engine supplies a handle.
    pub fn new(
        encoder: EventEncoder,
        queue: Arc<ReplicationQueue>,
        sealer: Option<KeySealer>,
        metrics: HaMetrics,
    ) -> Self {
        Self {
            encoder,
            queue,
            sealer,
            metrics,
        }
    }

    /// Queue this listener feeds
    pub fn queue(&self) -> &Arc<ReplicationQueue> {
        &self.queue
    }

    /// Report an engine event category this crate does not model
    ///
    /// Replicated as an `observed` record. Always returns true.
    pub fn unrecognized(&self, ike_sa: Option<&dyn IkeSa>, name: &str) -> bool {
        self.guarded("unrecognized", || {
            let sa = ike_sa.map(|s| identify("unrecognized", s)).transpose()?;
            Ok(LifecycleEvent::Unrecognized {
                sa,
                name: name.to_string(),
            })
        })
    }

    /// Admit an already built event
    pub fn submit(&self, event: LifecycleEvent) {
        let sa = event.sa();
        let kind = event.kind();
        let terminal = event.is_terminal();

        let mut fallback = false;
        let admission = self.queue.enqueue(sa, terminal, |sequence| {
            let record = self.encoder.encode(&event, sequence);
            fallback = record.event_kind != kind;
            record
        });

        if fallback {
            self.metrics.record_encode_fallback();
            logging::log_encode_fallback(sa, kind);
        }

        match admission {
            Admission::Accepted { .. } => self.metrics.record_enqueued(),
            Admission::Evicted { victim, .. } => {
                self.metrics.record_enqueued();
                self.metrics.record_evicted(1);
                logging::log_eviction(victim.sa, victim.kind, victim.sequence);
            }
            Admission::Shed(dropped) => {
                self.metrics.record_shed();
                logging::log_shed(dropped.sa, dropped.kind, dropped.sequence);
            }
            Admission::Closed => logging::log_dropped_after_close(sa, kind),
        }
    }

    fn guarded<F>(&self, hook: &'static str, build: F) -> bool
    where
        F: FnOnce() -> Result<LifecycleEvent>,
    {
        self.metrics.record_event_received();

        let outcome = catch_unwind(AssertUnwindSafe(|| build().map(|event| self.submit(event))));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(Error::ContractViolation { hook, reason })) => {
                self.metrics.record_contract_violation();
                logging::log_contract_violation(hook, &reason);
            }
            Ok(Err(e)) => {
                self.metrics.record_contract_violation();
                logging::log_contract_violation(hook, &e.to_string());
            }
            Err(_) => logging::log_hook_panicked(hook),
        }
        true
    }

    fn key_material(&self, sa: SaIdentifier, keys: &IkeKeys<'_>) -> KeyMaterialRef {
        if let Some(id) = keys.keymat_handle {
            return KeyMaterialRef::Handle { id };
        }
        let Some(sealer) = &self.sealer else {
            return KeyMaterialRef::Withheld;
        };

        let bundle = seal::pack(&[keys.shared_secret, keys.nonce_i, keys.nonce_r]);
        match sealer.seal(sa, &bundle) {
            Ok(sealed) => sealed,
            Err(e) => {
                logging::log_seal_failed(sa, &e.to_string());
                KeyMaterialRef::Withheld
            }
        }
    }
}

fn identify(hook: &'static str, ike_sa: &dyn IkeSa) -> Result<SaIdentifier> {
    match ike_sa.unique_id() {
        0 => Err(Error::ContractViolation {
            hook,
            reason: format!("SA '{}' has no unique id", ike_sa.name()),
        }),
        id => Ok(SaIdentifier::new(id)),
    }
}

impl BusListener for HaListener {
    fn alert(&self, ike_sa: Option<&dyn IkeSa>, code: u32, context: &str) -> bool {
        self.guarded("alert", || {
            let sa = ike_sa.map(|s| identify("alert", s)).transpose()?;
            Ok(LifecycleEvent::Alert {
                sa,
                code,
                context: context.to_string(),
            })
        })
    }

    fn ike_keys(&self, ike_sa: &dyn IkeSa, keys: &IkeKeys<'_>) -> bool {
        self.guarded("ike_keys", || {
            let sa = identify("ike_keys", ike_sa)?;
            let rekey_of = keys
                .rekey
                .map(|old| identify("ike_keys", old))
                .transpose()?;
            let role = if ike_sa.is_initiator() {
                NegotiationRole::Initiator
            } else {
                NegotiationRole::Responder
            };
            Ok(LifecycleEvent::KeysDerived {
                sa,
                key_material: self.key_material(sa, keys),
                role,
                auth_method: keys.auth_method,
                rekey_of,
            })
        })
    }

    fn ike_updown(&self, ike_sa: &dyn IkeSa, up: bool) -> bool {
        self.guarded("ike_updown", || {
            Ok(LifecycleEvent::Established {
                sa: identify("ike_updown", ike_sa)?,
                up,
            })
        })
    }

    fn ike_rekey(&self, old: &dyn IkeSa, new: &dyn IkeSa) -> bool {
        self.guarded("ike_rekey", || {
            let old_id = identify("ike_rekey", old)?;
            let new_id = identify("ike_rekey", new)?;
            if old_id == new_id {
                return Err(Error::ContractViolation {
                    hook: "ike_rekey",
                    reason: format!("old and new SA are both {}", old_id),
                });
            }
            Ok(LifecycleEvent::Rekeyed {
                old: old_id,
                new: new_id,
            })
        })
    }

    fn ike_state_change(&self, ike_sa: &dyn IkeSa, new: IkeSaState) -> bool {
        self.guarded("ike_state_change", || {
            Ok(LifecycleEvent::StateChanged {
                sa: identify("ike_state_change", ike_sa)?,
                new_state: new,
            })
        })
    }

    fn message(&self, ike_sa: &dyn IkeSa, message: &MessageMeta, incoming: bool, plain: bool) -> bool {
        self.guarded("message", || {
            Ok(LifecycleEvent::MessageObserved {
                sa: identify("message", ike_sa)?,
                direction: Direction::from_incoming(incoming),
                is_plaintext: plain,
                exchange: message.exchange,
                message_id: message.message_id,
            })
        })
    }
}
