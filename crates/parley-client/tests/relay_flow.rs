//! Offline relay flows against a mock relay served by axum on an ephemeral
//! port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, Query, State};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parley_client::contact::Contact;
use parley_client::handshake::{KeyExchange, KeyExchangeEvent, KeyExchangeState};
use parley_client::{
    ClientError, ContactRegistry, FetchOutcome, Inbound, InboundSink, Messenger, OfflineRelay,
    PushOutcome,
};
use parley_net::{ChannelTransport, OutboundEnvelope, RelayHttpClient};
use parley_shared::codec::WireRecord;
use parley_shared::identity::{derive_address, verify_signature, Identity};
use parley_shared::protocol::{AppMessage, AppMessageCode, Envelope, EnvelopeKind};
use parley_shared::types::{Address, EncryptionType, SessionSlot};
use parley_store::MemoryStore;
use tokio::sync::mpsc;

const CHALLENGE: &[u8] = b"challenge-0001";

// ============================================================
// Mock relay
// ============================================================

#[derive(Default)]
struct MockRelay {
    fetch_body: Mutex<String>,
    push_reply: Mutex<String>,
    unique_delay: Mutex<Duration>,
    unique_hits: AtomicUsize,
    fetch_hits: AtomicUsize,
    fetch_queries: Mutex<Vec<HashMap<String, String>>>,
    pushes: Mutex<Vec<HashMap<String, String>>>,
}

impl MockRelay {
    fn unique_hits(&self) -> usize {
        self.unique_hits.load(Ordering::SeqCst)
    }

    fn fetch_hits(&self) -> usize {
        self.fetch_hits.load(Ordering::SeqCst)
    }

    fn pushes(&self) -> Vec<HashMap<String, String>> {
        self.pushes.lock().unwrap().clone()
    }
}

async fn unique_id(State(relay): State<Arc<MockRelay>>) -> String {
    relay.unique_hits.fetch_add(1, Ordering::SeqCst);
    let delay = *relay.unique_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    BASE64.encode(CHALLENGE)
}

async fn fetch(
    State(relay): State<Arc<MockRelay>>,
    Query(query): Query<HashMap<String, String>>,
) -> String {
    relay.fetch_hits.fetch_add(1, Ordering::SeqCst);
    relay.fetch_queries.lock().unwrap().push(query);
    relay.fetch_body.lock().unwrap().clone()
}

async fn push(
    State(relay): State<Arc<MockRelay>>,
    Form(form): Form<HashMap<String, String>>,
) -> String {
    relay.pushes.lock().unwrap().push(form);
    relay.push_reply.lock().unwrap().clone()
}

async fn spawn_relay(fetch_body: &str, push_reply: &str) -> (String, Arc<MockRelay>) {
    let relay = Arc::new(MockRelay::default());
    *relay.fetch_body.lock().unwrap() = fetch_body.to_string();
    *relay.push_reply.lock().unwrap() = push_reply.to_string();

    let app = Router::new()
        .route("/uniqueid.php", get(unique_id))
        .route("/fetch.php", get(fetch))
        .route("/push.php", post(push))
        .with_state(relay.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), relay)
}

// ============================================================
// Client harness
// ============================================================

/// Inbound sink that records every payload it is handed.
#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<Vec<u8>>>,
}

impl InboundSink for RecordingSink {
    fn receive_data(&self, raw: &[u8], _source: Option<&Address>) -> Result<(), ClientError> {
        self.received.lock().unwrap().push(raw.to_vec());
        Ok(())
    }
}

struct Harness {
    registry: Arc<ContactRegistry>,
    relay: OfflineRelay,
    outbound: mpsc::Receiver<OutboundEnvelope>,
    mock: Arc<MockRelay>,
}

async fn harness(fetch_body: &str, push_reply: &str, sink: Option<Arc<dyn InboundSink>>) -> Harness {
    let (base, mock) = spawn_relay(fetch_body, push_reply).await;
    let (transport, outbound) = ChannelTransport::new(16);
    let registry = Arc::new(ContactRegistry::new(
        Arc::new(Identity::generate()),
        Arc::new(MemoryStore::new()),
        Arc::new(transport),
    ));
    let sink: Arc<dyn InboundSink> = match sink {
        Some(sink) => sink,
        None => Arc::new(Inbound::new(registry.clone())),
    };
    let http = RelayHttpClient::new(base, Duration::from_secs(5)).unwrap();
    let relay = OfflineRelay::new(http, registry.clone(), sink, Duration::from_secs(60));
    Harness {
        registry,
        relay,
        outbound,
        mock,
    }
}

fn add_peer(registry: &ContactRegistry) -> Address {
    let peer = Identity::generate();
    let address = peer.address();
    registry
        .add(Contact::new(
            address.clone(),
            Some(peer.public_key_bytes().to_vec()),
            "C",
            true,
        ))
        .unwrap();
    address
}

// ============================================================
// Push
// ============================================================

/// Contact created with no keys, keys generated and sent, relay says OK:
/// the handshake stage advances and the push is acknowledged.
#[tokio::test]
async fn test_handshake_bootstrap() {
    let h = harness("FALSE", "OK", None).await;
    let contact = add_peer(&h.registry);

    h.registry.apply_exchange(&contact, KeyExchangeEvent::Created);
    let keys = KeyExchange::new(h.registry.clone()).tick(&contact).unwrap();

    let record = h.registry.get(&contact).unwrap();
    assert!(record.has_both_keys());
    assert_eq!(record.handshake_stage(), 2);
    assert!(!record.relay_push_acked());

    let outcome = h.relay.push(&keys, false).await.unwrap();
    assert_eq!(outcome, PushOutcome::Accepted { acked: true });

    let record = h.registry.get(&contact).unwrap();
    assert!(record.relay_push_acked());
    assert_eq!(
        h.registry.exchange_state(&contact),
        Some(KeyExchangeState::AwaitingRemoteKeys)
    );

    let pushes = h.mock.pushes();
    assert_eq!(pushes.len(), 1);
    let form = &pushes[0];
    assert_eq!(form["tag"], contact.to_tag());
    assert_eq!(form["fa"], h.registry.identity().address().to_tag());
    assert_eq!(form["pk"], "");
    assert_eq!(form["push"], "False");

    let data = BASE64.decode(&form["data"]).unwrap();
    assert_eq!(Envelope::from_wire(&data).unwrap(), keys);

    // The relay only ever sees the keys sealed to the peer.
    assert_eq!(keys.encryption, EncryptionType::Asymmetric);
    for slot in [SessionSlot::A, SessionSlot::B] {
        let key = record.session_key(slot).unwrap();
        assert!(!data.windows(key.len()).any(|w| w == key.as_slice()));
    }
}

/// Only the contact request travels with our public key.
#[tokio::test]
async fn test_request_push_carries_public_key() {
    let mut h = harness("FALSE", "OK", None).await;
    let peer = Identity::generate();
    Messenger::new(h.registry.clone())
        .add_contact(&peer.public_key_bytes(), "D")
        .unwrap();

    let request = h.outbound.try_recv().unwrap().envelope;
    assert_eq!(request.handshake_sequence(), Some(1));

    let outcome = h.relay.push(&request, true).await.unwrap();
    assert_eq!(outcome, PushOutcome::Accepted { acked: true });

    let pushes = h.mock.pushes();
    let form = &pushes[0];
    assert_eq!(
        form["pk"],
        BASE64.encode(h.registry.identity().public_key_bytes())
    );
    assert_eq!(form["push"], "True");
}

#[tokio::test]
async fn test_regular_push_does_not_ack_handshake() {
    let mut h = harness("FALSE", "OK", None).await;
    let contact = add_peer(&h.registry);
    h.registry.set_handshake_stage(&contact, 2).unwrap();

    h.registry
        .send_app_message(
            &contact,
            vec![0xAB; 16],
            EnvelopeKind::Data,
            AppMessage::new(AppMessageCode::Chat, "hello"),
            true,
        )
        .unwrap();
    let chat = h.outbound.try_recv().unwrap().envelope;
    assert_eq!(chat.encryption, EncryptionType::Asymmetric);

    let outcome = h.relay.push(&chat, false).await.unwrap();
    assert_eq!(outcome, PushOutcome::Accepted { acked: false });
    assert!(!h.registry.get(&contact).unwrap().relay_push_acked());
    assert_eq!(h.mock.pushes()[0]["pk"], "");
}

/// Pushing to a wallet with no contact record succeeds without any HTTP call.
#[tokio::test]
async fn test_push_to_unknown_recipient_is_dropped() {
    let h = harness("FALSE", "OK", None).await;
    let identity = h.registry.identity();
    let mut envelope = Envelope::new(
        vec![0x01; 16],
        EnvelopeKind::Data,
        identity.address(),
        Address(vec![0x01, 0xEE, 0xEE]),
        EncryptionType::Asymmetric,
        b"dropped".to_vec(),
    );
    envelope.sign(identity);

    let outcome = h.relay.push(&envelope, true).await.unwrap();
    assert_eq!(outcome, PushOutcome::Dropped);
    assert!(h.mock.pushes().is_empty());
}

#[tokio::test]
async fn test_rejected_push_leaves_state_unchanged() {
    let h = harness("FALSE", "ERROR", None).await;
    let contact = add_peer(&h.registry);
    h.registry.apply_exchange(&contact, KeyExchangeEvent::Created);
    let keys = KeyExchange::new(h.registry.clone()).tick(&contact).unwrap();

    assert!(h.relay.push(&keys, false).await.is_err());
    assert!(!h.registry.get(&contact).unwrap().relay_push_acked());
    assert_eq!(
        h.registry.exchange_state(&contact),
        Some(KeyExchangeState::LocalKeysSent)
    );
}

/// A keys push the relay refused goes out again on the next tick, until the
/// relay acknowledges one.
#[tokio::test]
async fn test_refused_keys_push_is_retried() {
    let h = harness("FALSE", "ERROR", None).await;
    let contact = add_peer(&h.registry);
    let exchange = KeyExchange::new(h.registry.clone());
    h.registry.apply_exchange(&contact, KeyExchangeEvent::Created);

    let keys = exchange.tick(&contact).unwrap();
    assert!(h.relay.push(&keys, false).await.is_err());

    let resent = exchange.tick(&contact).unwrap();
    assert_eq!(resent.handshake_sequence(), Some(2));

    *h.mock.push_reply.lock().unwrap() = "OK".to_string();
    assert_eq!(
        h.relay.push(&resent, false).await.unwrap(),
        PushOutcome::Accepted { acked: true }
    );
    assert_eq!(
        h.registry.exchange_state(&contact),
        Some(KeyExchangeState::AwaitingRemoteKeys)
    );
    assert!(exchange.tick(&contact).is_none());
    assert_eq!(h.mock.pushes().len(), 2);
}

/// A second push of an already acknowledged stage reports no new ack.
#[tokio::test]
async fn test_repeated_push_reports_no_new_ack() {
    let h = harness("FALSE", "OK", None).await;
    let contact = add_peer(&h.registry);
    h.registry.apply_exchange(&contact, KeyExchangeEvent::Created);
    let keys = KeyExchange::new(h.registry.clone()).tick(&contact).unwrap();

    assert_eq!(
        h.relay.push(&keys, false).await.unwrap(),
        PushOutcome::Accepted { acked: true }
    );
    assert_eq!(
        h.relay.push(&keys, false).await.unwrap(),
        PushOutcome::Accepted { acked: false }
    );
}

// ============================================================
// Fetch
// ============================================================

#[tokio::test]
async fn test_fetch_cooldown() {
    let h = harness("FALSE", "OK", None).await;

    assert_eq!(h.relay.fetch(false).await.unwrap(), FetchOutcome::NoData);
    assert_eq!(h.relay.fetch(false).await.unwrap(), FetchOutcome::Skipped);
    assert_eq!(h.mock.unique_hits(), 1);
    assert_eq!(h.mock.fetch_hits(), 1);

    assert_eq!(h.relay.fetch(true).await.unwrap(), FetchOutcome::NoData);
    assert_eq!(h.mock.unique_hits(), 2);
    assert_eq!(h.mock.fetch_hits(), 2);
}

/// Concurrent fetches collapse into the one already in flight.
#[tokio::test]
async fn test_concurrent_fetches_are_single_flight() {
    let h = harness("FALSE", "OK", None).await;
    *h.mock.unique_delay.lock().unwrap() = Duration::from_millis(200);

    let (first, second) = tokio::join!(h.relay.fetch(true), h.relay.fetch(true));
    assert_eq!(first.unwrap(), FetchOutcome::NoData);
    assert_eq!(second.unwrap(), FetchOutcome::Skipped);
    assert_eq!(h.mock.unique_hits(), 1);
    assert_eq!(h.mock.fetch_hits(), 1);
}

#[tokio::test]
async fn test_fetch_signs_the_challenge() {
    let h = harness("FALSE", "OK", None).await;
    h.relay.fetch(true).await.unwrap();

    let query = h.mock.fetch_queries.lock().unwrap()[0].clone();
    let identity = h.registry.identity();
    assert_eq!(query["tag"], identity.address().to_tag());

    let signature = BASE64.decode(&query["sig"]).unwrap();
    verify_signature(&identity.public_key_bytes(), CHALLENGE, &signature).unwrap();
}

/// Receiving data lifts the cooldown so the rest of the queue can be drained.
#[tokio::test]
async fn test_data_resets_cooldown() {
    let sink = Arc::new(RecordingSink::default());
    let h = harness(r#"[["cGF5bG9hZDE=",""]]"#, "OK", Some(sink.clone() as Arc<dyn InboundSink>)).await;

    for _ in 0..2 {
        assert_eq!(
            h.relay.fetch(false).await.unwrap(),
            FetchOutcome::Delivered {
                entries: 1,
                failed: 0
            }
        );
    }
    assert_eq!(h.mock.fetch_hits(), 2);
    assert_eq!(sink.received.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_fetch_with_mixed_payloads() {
    let sink = Arc::new(RecordingSink::default());
    let h = harness(
        r#"[["cGF5bG9hZDE=",""],["cGF5bG9hZDI=","cHVia2V5Yg=="]]"#,
        "OK",
        Some(sink.clone() as Arc<dyn InboundSink>),
    )
    .await;

    let outcome = h.relay.fetch(false).await.unwrap();
    assert_eq!(
        outcome,
        FetchOutcome::Delivered {
            entries: 2,
            failed: 0
        }
    );
    assert_eq!(
        *sink.received.lock().unwrap(),
        vec![b"payload1".to_vec(), b"payload2".to_vec()]
    );

    let attached = h.registry.get(&derive_address(b"pubkeyb")).unwrap();
    assert_eq!(attached.public_key.as_deref(), Some(&b"pubkeyb"[..]));
    assert!(!attached.approved);
}

/// Undecodable entries are counted and skipped; the rest still go through.
#[tokio::test]
async fn test_fetch_entry_failures_are_isolated() {
    let h = harness(
        r#"[["cGF5bG9hZDE=",""],["%%%",""],["cGF5bG9hZDI=",""]]"#,
        "OK",
        None,
    )
    .await;

    assert_eq!(
        h.relay.fetch(true).await.unwrap(),
        FetchOutcome::Delivered {
            entries: 3,
            failed: 3
        }
    );
}

/// A contact request queued on the relay reaches the real inbound path.
#[tokio::test]
async fn test_fetch_delivers_contact_request() {
    let (transport, _rx) = ChannelTransport::new(4);
    let sender = Arc::new(ContactRegistry::new(
        Arc::new(Identity::generate()),
        Arc::new(MemoryStore::new()),
        Arc::new(transport),
    ));

    let h0 = harness("FALSE", "OK", None).await;
    let local = h0.registry.identity();
    sender
        .add(Contact::new(
            local.address(),
            Some(local.public_key_bytes().to_vec()),
            "me",
            true,
        ))
        .unwrap();
    let request = sender
        .send_app_message(
            &local.address(),
            vec![1],
            EnvelopeKind::Info,
            AppMessage::new(
                AppMessageCode::RequestAdd,
                sender.identity().public_key_bytes().to_vec(),
            ),
            false,
        )
        .unwrap();

    *h0.mock.fetch_body.lock().unwrap() = format!(
        r#"[["{}","{}"]]"#,
        BASE64.encode(request.to_wire()),
        BASE64.encode(sender.identity().public_key_bytes())
    );
    assert_eq!(
        h0.relay.fetch(true).await.unwrap(),
        FetchOutcome::Delivered {
            entries: 1,
            failed: 0
        }
    );

    let requester = sender.identity().address();
    let contact = h0.registry.get(&requester).unwrap();
    assert!(!contact.approved);
    assert_eq!(contact.handshake_stage(), 1);
    assert_eq!(h0.registry.message_count(&requester).unwrap(), 1);
}
