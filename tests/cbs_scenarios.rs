//! Integration-level seed scenarios (§8) against in-memory fakes of the AMQP
//! boundary traits — no real broker involved, mirroring the teacher's
//! `demo.rs` exercising the UI against canned data instead of a live MQTT
//! connection.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use amqp_cbs_auth::amqp::{
    AmqpLinkError, AttachedLinks, CbsMessage, DeliveryOutcome, LinkFactory, LinkReceiver,
    LinkSender, OpenView,
};
use amqp_cbs_auth::provider::{TokenInfo, TokenProvider};
use amqp_cbs_auth::sasl::{decode_init_response, encode_init_response, SaslOutcome, SaslToken};
use amqp_cbs_auth::CbsClient;

/// A fake `$cbs` node: answers MessageBased `put-token` requests with a
/// 200 response whose body mirrors the request body, and records LinkBased
/// `set-token` sends directly.
struct FakeCbsNode {
    receiver_handler: Mutex<Option<Box<dyn Fn(CbsMessage) + Send + Sync>>>,
    put_token_requests: Mutex<Vec<CbsMessage>>,
    set_token_requests: Mutex<Vec<CbsMessage>>,
    connection_closed: AtomicBool,
    send_count: AtomicUsize,
    last_receiver_credit: AtomicUsize,
}

impl FakeCbsNode {
    fn new() -> Arc<Self> {
        Arc::new(FakeCbsNode {
            receiver_handler: Mutex::new(None),
            put_token_requests: Mutex::new(Vec::new()),
            set_token_requests: Mutex::new(Vec::new()),
            connection_closed: AtomicBool::new(false),
            send_count: AtomicUsize::new(0),
            last_receiver_credit: AtomicUsize::new(0),
        })
    }
}

struct FakeSender {
    node: Arc<FakeCbsNode>,
}

#[async_trait::async_trait]
impl LinkSender for FakeSender {
    async fn send(&self, message: CbsMessage) -> Result<DeliveryOutcome, AmqpLinkError> {
        self.node.send_count.fetch_add(1, Ordering::SeqCst);
        if message
            .application_properties
            .get("operation")
            .map(String::as_str)
            == Some("put-token")
        {
            self.node.put_token_requests.lock().unwrap().push(message.clone());
            let node = self.node.clone();
            let message_id = message.message_id.clone();
            tokio::spawn(async move {
                let handler_guard = node.receiver_handler.lock().unwrap();
                if let Some(handler) = handler_guard.as_ref() {
                    let mut response = CbsMessage {
                        correlation_id: message_id,
                        body: message.body.clone(),
                        ..Default::default()
                    };
                    response
                        .application_properties
                        .insert("status-code".to_string(), "200".to_string());
                    handler(response);
                }
            });
        } else if message.subject.as_deref() == Some("set-token") {
            self.node.set_token_requests.lock().unwrap().push(message);
        }
        Ok(DeliveryOutcome::Accepted)
    }

    fn is_closed(&self) -> bool {
        self.node.connection_closed.load(Ordering::Acquire)
    }
}

struct FakeReceiver {
    node: Arc<FakeCbsNode>,
}

impl LinkReceiver for FakeReceiver {
    fn set_handler(&self, handler: Box<dyn Fn(CbsMessage) + Send + Sync>) {
        *self.node.receiver_handler.lock().unwrap() = Some(handler);
    }
}

struct FakeFactory {
    node: Arc<FakeCbsNode>,
}

#[async_trait::async_trait]
impl LinkFactory for FakeFactory {
    async fn attach(&self, _node_name: &str, receiver_credit: u32) -> Option<AttachedLinks> {
        self.node
            .last_receiver_credit
            .store(receiver_credit as usize, Ordering::SeqCst);
        Some(AttachedLinks {
            sender: Arc::new(FakeSender {
                node: self.node.clone(),
            }),
            receiver: Arc::new(FakeReceiver {
                node: self.node.clone(),
            }),
        })
    }

    async fn attach_sender_only(&self, _node_name: &str) -> Option<Arc<dyn LinkSender>> {
        Some(Arc::new(FakeSender {
            node: self.node.clone(),
        }))
    }

    fn is_connection_closed(&self) -> bool {
        self.node.connection_closed.load(Ordering::Acquire)
    }
}

struct FakeOpen {
    offered_cbs: bool,
}

impl OpenView for FakeOpen {
    fn advertise_cbs_capability(&mut self) {}
    fn offers_cbs_capability(&self) -> bool {
        self.offered_cbs
    }
    fn cbs_node_override(&self) -> Option<String> {
        None
    }
}

struct FakeProvider {
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
}

#[async_trait::async_trait]
impl TokenProvider for FakeProvider {
    async fn get_token(
        &self,
        _audience: &str,
        _claims: &[String],
        duration: Duration,
    ) -> Result<TokenInfo, Box<dyn std::error::Error + Send + Sync>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err("provider exploded".into());
        }
        Ok(TokenInfo::new(
            "test",
            "jwt",
            time::OffsetDateTime::now_utc() + duration,
        ))
    }
}

/// Installs a global `tracing` subscriber for this test binary, if one
/// isn't already installed.
fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

#[tokio::test]
async fn message_based_cbs_handshake() {
    init_tracing();
    let node = FakeCbsNode::new();
    let factory = Arc::new(FakeFactory { node: node.clone() });
    let provider = Arc::new(FakeProvider {
        calls: AtomicUsize::new(0),
        fail_on_call: None,
    });
    let client = CbsClient::new(factory, provider);

    client
        .protocol
        .on_remote_open(&FakeOpen { offered_cbs: false })
        .await;

    client
        .renewal
        .authenticate(
            "http://H/Q",
            vec!["Send".into(), "Listen".into()],
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let requests = node.put_token_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, b"test".to_vec());
    assert_eq!(
        requests[0].application_properties.get("name"),
        Some(&"http://H/Q".to_string())
    );
}

#[tokio::test]
async fn link_based_cbs_handshake() {
    let node = FakeCbsNode::new();
    let factory = Arc::new(FakeFactory { node: node.clone() });
    let provider = Arc::new(FakeProvider {
        calls: AtomicUsize::new(0),
        fail_on_call: None,
    });
    let client = CbsClient::new(factory, provider);

    client
        .protocol
        .on_remote_open(&FakeOpen { offered_cbs: true })
        .await;

    client
        .renewal
        .authenticate(
            "http://H/Q",
            vec!["Send".into(), "Listen".into()],
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(node.put_token_requests.lock().unwrap().is_empty());
    let set_token = node.set_token_requests.lock().unwrap();
    assert_eq!(set_token.len(), 1);
    assert_eq!(set_token[0].subject.as_deref(), Some("set-token"));
}

#[tokio::test(start_paused = true)]
async fn renewal_under_load_reauthenticates_before_expiry() {
    let node = FakeCbsNode::new();
    let factory = Arc::new(FakeFactory { node: node.clone() });
    let provider = Arc::new(FakeProvider {
        calls: AtomicUsize::new(0),
        fail_on_call: None,
    });
    let client = CbsClient::new(factory, provider);
    client
        .protocol
        .on_remote_open(&FakeOpen { offered_cbs: false })
        .await;
    client.renewal.set_token_duration(Duration::from_secs(2));

    for audience in ["aud-a", "aud-b", "aud-c"] {
        client
            .renewal
            .authenticate(audience, vec!["Send".into()], true, CancellationToken::new())
            .await
            .unwrap();
    }

    for _ in 0..10 {
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
    }

    // Each of the 3 audiences should have renewed multiple times over the
    // ~10s window at a 2s token duration.
    assert!(node.put_token_requests.lock().unwrap().len() >= 12);
}

#[tokio::test(start_paused = true)]
async fn renewal_failure_reports_on_error_and_other_audiences_continue() {
    let node = FakeCbsNode::new();
    let factory = Arc::new(FakeFactory { node: node.clone() });
    // First 2 calls succeed (initial authenticate for 2 audiences); the 3rd
    // call — the first renewal attempt — fails for whichever audience hits
    // it first.
    let provider = Arc::new(FakeProvider {
        calls: AtomicUsize::new(0),
        fail_on_call: Some(3),
    });
    let client = CbsClient::new(factory, provider);
    client
        .protocol
        .on_remote_open(&FakeOpen { offered_cbs: false })
        .await;
    client.renewal.set_token_duration(Duration::from_millis(500));

    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    let errors2 = errors.clone();
    client
        .renewal
        .set_on_error(Arc::new(move |audience, _claims, _err| {
            errors2.lock().unwrap().push(audience.to_string());
        }));

    client
        .renewal
        .authenticate("aud-1", vec![], true, CancellationToken::new())
        .await
        .unwrap();
    client
        .renewal
        .authenticate("aud-2", vec![], true, CancellationToken::new())
        .await
        .unwrap();

    for _ in 0..5 {
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
    }

    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn credit_stress_100_sequential_authenticates_all_succeed() {
    let node = FakeCbsNode::new();
    let factory = Arc::new(FakeFactory { node: node.clone() });
    let provider = Arc::new(FakeProvider {
        calls: AtomicUsize::new(0),
        fail_on_call: None,
    });
    let client = CbsClient::new(factory, provider);
    client
        .protocol
        .on_remote_open(&FakeOpen { offered_cbs: false })
        .await;

    for _ in 0..100 {
        client
            .renewal
            .authenticate("aud", vec![], false, CancellationToken::new())
            .await
            .unwrap();
    }

    assert_eq!(node.put_token_requests.lock().unwrap().len(), 100);
    assert_eq!(
        node.last_receiver_credit.load(Ordering::SeqCst),
        amqp_cbs_auth::amqp::RECEIVER_CREDIT as usize
    );
}

#[test]
fn sasl_encode_decode_two_tokens() {
    let tokens = vec![
        SaslToken::new("jwt", "A.B.C"),
        SaslToken::new("sas", "sig=x&se=1"),
    ];
    let encoded = encode_init_response(&tokens);
    assert!(encoded.ends_with(&[0, 0]));
    assert_eq!(decode_init_response(&encoded), SaslOutcome::Ok(tokens));
}
