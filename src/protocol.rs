//! CBS protocol dispatcher (C4).
//!
//! Wired into the AMQP stack as a `ConnectionLocalOpen` / `ConnectionRemoteOpen`
//! handler (§4.4). Selects the CBS protocol variant exactly once, at
//! `RemoteOpen`, based on whether the peer offers the `AMQP_CBS_V1_0`
//! capability, then shapes and sends `put-token` / `set-token` requests for
//! whichever variant won.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::amqp::{CbsMessage, LinkFactory, OpenView, DEFAULT_CBS_NODE};
use crate::error::CbsError;
use crate::provider::TokenInfo;
use crate::request_response::RequestResponseClient;

const OPERATION: &str = "operation";
const PUT_TOKEN: &str = "put-token";
const NAME: &str = "name";
const TYPE: &str = "type";
const STATUS_CODE: &str = "status-code";
const TOKEN_TYPE: &str = "token-type";
const SET_TOKEN_SUBJECT: &str = "set-token";

/// The narrow surface the renewal scheduler (C3) needs from C4, kept as a
/// trait so C3 can be unit-tested against a fake dispatcher (§8) instead of
/// a real link factory.
#[async_trait]
pub trait CbsDispatcher: Send + Sync {
    async fn set_token(
        &self,
        audience: &str,
        token: &TokenInfo,
        cancellation: CancellationToken,
    ) -> Result<(), CbsError>;

    /// Whether the CBS variant has been selected (i.e. `RemoteOpen` fired).
    fn is_ready(&self) -> bool;

    fn is_connection_closed(&self) -> bool;
}

/// Which put-token protocol this connection negotiated (§3, §4.4). Selected
/// exactly once, at `RemoteOpen`, and immutable thereafter.
enum CbsVariant {
    MessageBased {
        client: RequestResponseClient,
    },
    LinkBased {
        sender: Arc<dyn crate::amqp::LinkSender>,
    },
}

/// CBS protocol dispatcher for one AMQP connection.
pub struct CbsProtocol {
    factory: Arc<dyn LinkFactory>,
    variant: Mutex<Option<CbsVariant>>,
}

impl CbsProtocol {
    pub fn new(factory: Arc<dyn LinkFactory>) -> Arc<Self> {
        Arc::new(CbsProtocol {
            factory,
            variant: Mutex::new(None),
        })
    }

    /// `ConnectionLocalOpen` handler: advertise CBS support.
    pub fn on_local_open(&self, open: &mut impl OpenView) {
        open.advertise_cbs_capability();
    }

    /// `ConnectionRemoteOpen` handler: select the variant exactly once
    /// (§3 "selected exactly once per connection"). A second call is a
    /// no-op — this models "does not change thereafter".
    pub async fn on_remote_open(&self, open: &impl OpenView) {
        if self.variant.lock().expect("state lock poisoned").is_some() {
            return;
        }

        if open.offers_cbs_capability() {
            let node_name = open
                .cbs_node_override()
                .unwrap_or_else(|| DEFAULT_CBS_NODE.to_string());
            info!(node = %node_name, variant = "LinkBased", "CBS variant selected");
            if let Some(sender) = self.factory.attach_sender_only(&node_name).await {
                *self.variant.lock().expect("state lock poisoned") =
                    Some(CbsVariant::LinkBased { sender });
            }
        } else {
            info!(node = DEFAULT_CBS_NODE, variant = "MessageBased", "CBS variant selected");
            let client = RequestResponseClient::new(DEFAULT_CBS_NODE, self.factory.clone());
            *self.variant.lock().expect("state lock poisoned") =
                Some(CbsVariant::MessageBased { client });
        }
    }

    async fn set_token_message_based(
        client: &RequestResponseClient,
        audience: &str,
        token: &TokenInfo,
        cancellation: CancellationToken,
    ) -> Result<(), CbsError> {
        let mut request = CbsMessage {
            body: token.token.clone().into_bytes(),
            ..Default::default()
        };
        request
            .application_properties
            .insert(OPERATION.to_string(), PUT_TOKEN.to_string());
        request
            .application_properties
            .insert(NAME.to_string(), audience.to_string());
        request
            .application_properties
            .insert(TYPE.to_string(), token.token_type.clone());

        let response = client.send(request, cancellation).await?;

        let status: i64 = response
            .application_property_i64(STATUS_CODE)
            .ok_or_else(|| CbsError::amqp("amqp:cbs:invalid-response", "missing status-code"))?;

        match status {
            200 | 202 => Ok(()),
            _ => {
                let description = response
                    .application_properties
                    .get("status-description")
                    .cloned()
                    .unwrap_or_default();
                let condition = response
                    .application_properties
                    .get("error-condition")
                    .cloned()
                    .unwrap_or_else(|| "amqp:cbs:put-token-failed".to_string());
                Err(CbsError::amqp(condition, description))
            }
        }
    }

    async fn set_token_link_based(
        sender: &Arc<dyn crate::amqp::LinkSender>,
        audience: &str,
        token: &TokenInfo,
    ) -> Result<(), CbsError> {
        let mut request = CbsMessage {
            subject: Some(SET_TOKEN_SUBJECT.to_string()),
            body: token.token.clone().into_bytes(),
            ..Default::default()
        };
        // The LinkBased variant targets the CBS node directly; `audience` is
        // not part of the wire shape (§4.4, §6.3) — the peer identifies the
        // audience from the token itself.
        let _ = audience;
        request
            .application_properties
            .insert(TOKEN_TYPE.to_string(), token.token_type.clone());

        match sender.send(request).await {
            Ok(crate::amqp::DeliveryOutcome::Accepted) => Ok(()),
            Ok(crate::amqp::DeliveryOutcome::Rejected { description }) => {
                Err(CbsError::amqp("rejected", description))
            }
            Ok(crate::amqp::DeliveryOutcome::Released) => Err(CbsError::amqp(
                "released",
                "peer released the set-token delivery",
            )),
            Err(err) => Err(CbsError::amqp("send-failed", err.to_string())),
        }
    }
}

#[async_trait]
impl CbsDispatcher for CbsProtocol {
    async fn set_token(
        &self,
        audience: &str,
        token: &TokenInfo,
        cancellation: CancellationToken,
    ) -> Result<(), CbsError> {
        let variant = {
            let guard = self.variant.lock().expect("state lock poisoned");
            match guard.as_ref() {
                None => {
                    return Err(CbsError::invalid_operation(
                        "CBS variant not yet selected: connection has not completed remote-open",
                    ))
                }
                Some(CbsVariant::MessageBased { client }) => {
                    Variant::MessageBased(client.clone())
                }
                Some(CbsVariant::LinkBased { sender }) => Variant::LinkBased(sender.clone()),
            }
        };

        match variant {
            Variant::MessageBased(client) => {
                Self::set_token_message_based(&client, audience, token, cancellation).await
            }
            Variant::LinkBased(sender) => Self::set_token_link_based(&sender, audience, token).await,
        }
    }

    fn is_ready(&self) -> bool {
        self.variant.lock().expect("state lock poisoned").is_some()
    }

    fn is_connection_closed(&self) -> bool {
        self.factory.is_connection_closed()
    }
}

/// Owned snapshot of the selected variant, taken under the lock so the
/// actual send doesn't hold it across an await point.
enum Variant {
    MessageBased(RequestResponseClient),
    LinkBased(Arc<dyn crate::amqp::LinkSender>),
}
