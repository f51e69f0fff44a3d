//! The external AMQP 1.0 boundary.
//!
//! Everything in this module is an *interface* onto a pre-existing AMQP
//! stack (`fe2o3-amqp` / `fe2o3-amqp-types`) — framing, link credit,
//! delivery state, and session/connection lifecycle all live there (§1).
//! This crate never constructs a `fe2o3_amqp::Connection` itself; it is
//! wired in by the embedding application as an event handler
//! (`ConnectionLocalOpen` / `ConnectionRemoteOpen`, see [`crate::protocol`])
//! and as a [`LinkFactory`] that (re)attaches the request/response link
//! pair on demand.
//!
//! Only capability negotiation (§4.4, §6.5) touches real `fe2o3-amqp-types`
//! performatives directly; the request/response engine and protocol
//! dispatcher are written against the small traits below so they can be
//! driven by in-memory fakes in tests (§8) without a broker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fe2o3_amqp_types::performatives::Open;
use fe2o3_amqp_types::primitives::{Symbol, Value};

/// The capability symbol a CBS-capable client advertises in its local
/// `Open.desired-capabilities` (§4.4, §6.5).
pub const CBS_CAPABILITY: &str = "AMQP_CBS_V1_0";

/// The `Open.properties` key a peer may use to override the default `$cbs`
/// node name.
pub const CBS_NODE_PROPERTY: &str = "$cbs";

/// Default CBS node name when the peer doesn't override it via
/// `Open.properties`.
pub const DEFAULT_CBS_NODE: &str = "$cbs";

/// A read/append view onto the local and remote `Open` performatives,
/// narrowed to what CBS capability negotiation needs. Implemented directly
/// for [`fe2o3_amqp_types::performatives::Open`] below; a fake
/// implementation backs the protocol dispatcher's unit tests.
pub trait OpenView {
    /// Appends the CBS capability symbol to `desired-capabilities`. Called
    /// from the `ConnectionLocalOpen` handler.
    fn advertise_cbs_capability(&mut self);

    /// Whether the peer's `offered-capabilities` contains the CBS symbol.
    fn offers_cbs_capability(&self) -> bool;

    /// The CBS node name from `Open.properties["$cbs"]`, if the peer set
    /// one.
    fn cbs_node_override(&self) -> Option<String>;
}

impl OpenView for Open {
    fn advertise_cbs_capability(&mut self) {
        let symbol = Symbol::from(CBS_CAPABILITY);
        match &mut self.desired_capabilities {
            Some(caps) if !caps.iter().any(|c| c == &symbol) => caps.push(symbol),
            Some(_) => {}
            None => self.desired_capabilities = Some(vec![symbol]),
        }
    }

    fn offers_cbs_capability(&self) -> bool {
        self.offered_capabilities
            .as_ref()
            .is_some_and(|caps| caps.iter().any(|c| c.as_str() == CBS_CAPABILITY))
    }

    fn cbs_node_override(&self) -> Option<String> {
        let props: &BTreeMap<Symbol, Value> = self.properties.as_ref()?;
        match props.get(&Symbol::from(CBS_NODE_PROPERTY))? {
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// An AMQP message reduced to the fields the CBS layer reads or writes.
/// Adapting this to/from `fe2o3_amqp_types::messaging::Message` is transport
/// glue that lives at the `LinkFactory` implementation, outside this crate's
/// core (§1 — TLS/transport setup is out of scope).
#[derive(Debug, Clone, Default)]
pub struct CbsMessage {
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub subject: Option<String>,
    pub application_properties: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl CbsMessage {
    pub fn application_property_i64(&self, key: &str) -> Option<i64> {
        self.application_properties.get(key)?.parse().ok()
    }
}

/// Outcome of a settled delivery, as reported by the AMQP stack's sender
/// link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected { description: String },
    Released,
}

#[derive(Debug, thiserror::Error)]
pub enum AmqpLinkError {
    #[error("link send failed: {0}")]
    Send(String),
    #[error("link or session closed")]
    Closed,
}

/// A single outgoing link, used directly by the LinkBased CBS variant
/// (§4.4) and internally by the request/response engine's sender half.
#[async_trait]
pub trait LinkSender: Send + Sync {
    async fn send(&self, message: CbsMessage) -> Result<DeliveryOutcome, AmqpLinkError>;

    /// Whether the session/sender this link belongs to has been torn down.
    /// The request/response engine treats any closed member of the link
    /// trio as a signal to rebuild the whole trio (§3 `LinkState`).
    fn is_closed(&self) -> bool;
}

/// A single incoming link. The handler is invoked on whichever thread the
/// AMQP stack dispatches deliveries on (§5) — implementations must issue the
/// AMQP `Accept` before invoking it, per §4.2's correlation rule.
pub trait LinkReceiver: Send + Sync {
    fn set_handler(&self, handler: Box<dyn Fn(CbsMessage) + Send + Sync>);
}

/// The pair of attached links the request/response engine (C2) drives.
#[derive(Clone)]
pub struct AttachedLinks {
    pub sender: std::sync::Arc<dyn LinkSender>,
    pub receiver: std::sync::Arc<dyn LinkReceiver>,
}

impl AttachedLinks {
    /// True if any member of the trio has been torn down — the session
    /// isn't modeled explicitly here, so a closed sender stands in for "the
    /// session this link pair lives on is gone" (§3 `LinkState`).
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Initial receiver credit granted by `Setup` (§4.2). The engine never tops
/// this up; credit refill beyond the initial grant is delegated to the AMQP
/// stack.
pub const RECEIVER_CREDIT: u32 = 50;

/// Builds (or rebuilds) the session/sender/receiver trio for a named node.
/// This is the `Setup` operation of §4.2: "if any of session/sender/receiver
/// is absent or closed, close the session (zero-timeout), build a fresh
/// session, a sender to `node_name`, and a receiver whose source is
/// `node_name` and target is `node_name.reply-to`, with credit 50."
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Returns `None` if the client or the underlying connection is closed —
    /// the caller must treat this as "the client is going away" (§4.2) and
    /// transition the in-flight slot to *Cancelled*, not *Failed*.
    ///
    /// `receiver_credit` is the initial credit to grant the receiver link
    /// (§4.2); callers pass [`RECEIVER_CREDIT`].
    async fn attach(&self, node_name: &str, receiver_credit: u32) -> Option<AttachedLinks>;

    /// A single pre-attached sender link to `node_name`, used by the
    /// LinkBased CBS variant (§4.4). Does not participate in request/reply
    /// correlation.
    async fn attach_sender_only(&self, node_name: &str) -> Option<std::sync::Arc<dyn LinkSender>>;

    fn is_connection_closed(&self) -> bool;
}
