//! Offline relay: queues envelopes for unreachable contacts and fetches the
//! ones queued for us.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parley_net::{FetchEntry, FetchResponse, OutboundEnvelope, PushForm, RelayError, RelayHttpClient};
use parley_shared::codec::WireRecord;
use parley_shared::constants::HANDSHAKE_SEQ_REQUEST;
use parley_shared::protocol::Envelope;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::handshake::KeyExchangeEvent;
use crate::inbound::InboundSink;
use crate::registry::ContactRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The recipient is not a contact; nothing was sent.
    Dropped,
    /// The relay answered `OK`. `acked` is set when this push recorded the
    /// acknowledgement of the contact's current handshake stage.
    Accepted { acked: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Cooldown still running or another fetch in flight.
    Skipped,
    NoData,
    Delivered { entries: usize, failed: usize },
}

pub struct OfflineRelay {
    http: RelayHttpClient,
    registry: Arc<ContactRegistry>,
    inbound: Arc<dyn InboundSink>,
    cooldown: Duration,
    last_fetch: Mutex<Option<Instant>>,
}

impl OfflineRelay {
    pub fn new(
        http: RelayHttpClient,
        registry: Arc<ContactRegistry>,
        inbound: Arc<dyn InboundSink>,
        cooldown: Duration,
    ) -> Self {
        Self {
            http,
            registry,
            inbound,
            cooldown,
            last_fetch: Mutex::new(None),
        }
    }

    /// Queue `envelope` on the relay. `notify` asks the relay to wake the
    /// recipient.
    pub async fn push(&self, envelope: &Envelope, notify: bool) -> std::result::Result<PushOutcome, RelayError> {
        let recipient = &envelope.recipient;
        let Some(contact) = self.registry.get(recipient) else {
            debug!(contact = %recipient, "push to unknown recipient dropped");
            return Ok(PushOutcome::Dropped);
        };

        let sequence = envelope.handshake_sequence();
        let pk = if sequence == Some(HANDSHAKE_SEQ_REQUEST) {
            BASE64.encode(self.registry.identity().public_key_bytes())
        } else {
            String::new()
        };

        let form = PushForm {
            tag: recipient.to_tag(),
            data: BASE64.encode(envelope.to_wire()),
            pk,
            push: notify,
            fa: envelope.sender.to_tag(),
        };
        self.http.push(&form).await?;

        let acked = match sequence {
            Some(seq) if i32::from(seq) >= contact.handshake_stage() => {
                match self.registry.mark_relay_push_acked(recipient, seq) {
                    Ok(acked) => acked,
                    Err(e) => {
                        warn!(contact = %recipient, error = %e, "failed to record relay ack");
                        false
                    }
                }
            }
            _ => false,
        };
        if acked {
            self.registry
                .apply_exchange(recipient, KeyExchangeEvent::PushAcknowledged);
        }
        debug!(contact = %recipient, ?sequence, acked, "envelope pushed to relay");
        Ok(PushOutcome::Accepted { acked })
    }

    /// Fetch and dispatch queued envelopes. Without `force` this is a no-op
    /// until the cooldown has passed since the last attempt.
    pub async fn fetch(&self, force: bool) -> std::result::Result<FetchOutcome, RelayError> {
        let Ok(mut last_fetch) = self.last_fetch.try_lock() else {
            debug!("relay fetch already in flight");
            return Ok(FetchOutcome::Skipped);
        };
        if !force && last_fetch.is_some_and(|at| at.elapsed() < self.cooldown) {
            return Ok(FetchOutcome::Skipped);
        }
        *last_fetch = Some(Instant::now());

        let identity = self.registry.identity();
        let challenge = self.http.unique_id().await?;
        let signature = identity.sign(&challenge);
        let response = self
            .http
            .fetch(&identity.address().to_tag(), &signature.to_bytes())
            .await?;

        let entries = match response {
            FetchResponse::Empty => return Ok(FetchOutcome::NoData),
            FetchResponse::Entries(entries) => entries,
        };
        // More may be queued; allow an immediate follow-up.
        *last_fetch = None;

        let mut failed = 0;
        for (index, entry) in entries.iter().enumerate() {
            if let Err(e) = self.deliver(entry) {
                failed += 1;
                warn!(index, error = %e, "relay entry not delivered");
            }
        }
        info!(entries = entries.len(), failed, "relay fetch complete");
        Ok(FetchOutcome::Delivered {
            entries: entries.len(),
            failed,
        })
    }

    fn deliver(&self, entry: &FetchEntry) -> Result<()> {
        let payload = BASE64.decode(&entry.payload).map_err(RelayError::from)?;
        if !entry.public_key.is_empty() {
            match BASE64.decode(&entry.public_key) {
                Ok(pk) => {
                    if let Err(e) = self.registry.resolve_or_create(&pk) {
                        warn!(error = %e, "failed to attach relayed public key");
                    }
                }
                Err(e) => warn!(error = %e, "relayed public key is not base64"),
            }
        }
        self.inbound.receive_data(&payload, None)
    }

    /// Periodic `fetch(false)`.
    pub fn spawn_fetch_loop(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.fetch(false).await {
                    warn!(error = %e, "relay fetch failed");
                }
            }
        })
    }

    /// Push every envelope the transport emits. Ends when the transport is
    /// dropped.
    pub fn spawn_push_pump(self: Arc<Self>, mut outbound: mpsc::Receiver<OutboundEnvelope>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(OutboundEnvelope { recipient, envelope }) = outbound.recv().await {
                if let Err(e) = self.push(&envelope, true).await {
                    warn!(contact = %recipient, error = %e, "relay push failed");
                }
            }
            debug!("outbound channel closed");
        })
    }
}
