//! Claims-Based Security (CBS) authentication and request/response
//! correlation for AMQP 1.0 clients.
//!
//! This crate layers CBS token push/renewal and a generic request/response
//! correlation engine on top of a pre-existing AMQP 1.0 connection/session/
//! link stack (`fe2o3-amqp`). It does not implement AMQP framing, link
//! credit, delivery state, or connection lifecycle — see [`amqp`] for the
//! boundary traits this crate drives instead.
//!
//! Composition:
//! - [`queue`] — lock-free single-consumer work serializer (C1).
//! - [`request_response`] — paired sender/receiver correlation engine (C2).
//! - [`renewal`] — single-timer multi-audience token renewal (C3).
//! - [`protocol`] — CBS variant selection and wire shaping (C4).
//! - [`sasl`] — the `AMQPCBS` SASL mechanism codec (C5).
//! - [`provider`] — the token provider interface (C6).

pub mod amqp;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod renewal;
pub mod request_response;
pub mod sasl;

#[cfg(test)]
pub(crate) mod test_support {
    /// Installs a global `tracing` subscriber for the current test process,
    /// if one isn't already installed. Safe to call from every test.
    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt::try_init();
    }
}

pub use error::{CbsError, Result};
pub use protocol::{CbsDispatcher, CbsProtocol};
pub use provider::{TokenInfo, TokenProvider};
pub use renewal::{OnError, RenewalConfig, RenewalScheduler};
pub use request_response::RequestResponseClient;

/// Connects a [`RenewalScheduler`] and a [`CbsProtocol`] dispatcher built
/// against the same [`amqp::LinkFactory`], wiring C3's `Authenticate` calls
/// through C4's `SetToken`. This is the shape an embedding application's
/// `ConnectionLocalOpen`/`ConnectionRemoteOpen` handlers drive (§4.4).
pub struct CbsClient {
    pub protocol: std::sync::Arc<CbsProtocol>,
    pub renewal: std::sync::Arc<RenewalScheduler>,
}

impl CbsClient {
    pub fn new(
        factory: std::sync::Arc<dyn amqp::LinkFactory>,
        provider: std::sync::Arc<dyn TokenProvider>,
    ) -> Self {
        let protocol = CbsProtocol::new(factory);
        let renewal = RenewalScheduler::new(provider, protocol.clone());
        CbsClient { protocol, renewal }
    }
}
