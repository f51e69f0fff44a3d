//! CBS SASL profile (C5).
//!
//! A stateless encoder/decoder for the `AMQPCBS` SASL mechanism (§4.5,
//! §6.4). It carries token blobs end-to-end in the SASL initial response;
//! verifying them is someone else's job (§1 Out of scope).

/// Mechanism name advertised during SASL negotiation.
pub const MECHANISM_NAME: &str = "AMQPCBS";

/// One `type token` pair carried in the init response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslToken {
    pub token_type: String,
    pub token: String,
}

impl SaslToken {
    pub fn new(token_type: impl Into<String>, token: impl Into<String>) -> Self {
        SaslToken {
            token_type: token_type.into(),
            token: token.into(),
        }
    }
}

/// Result of server-side parsing of an init response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslOutcome {
    /// All records parsed and the list was non-empty.
    Ok(Vec<SaslToken>),
    /// At least one record failed to parse into exactly `[type, token]`.
    Auth,
}

/// Client-init initial response bytes: for each token, append
/// `"{type} {token}"` then a NUL byte; finally append one extra NUL (§4.5).
pub fn encode_init_response(tokens: &[SaslToken]) -> Vec<u8> {
    let mut out = Vec::new();
    for token in tokens {
        out.extend_from_slice(token.token_type.as_bytes());
        out.push(b' ');
        out.extend_from_slice(token.token.as_bytes());
        out.push(0);
    }
    out.push(0);
    out
}

/// Server-parse: split on NUL; each non-empty field is split on a single
/// space boundary into `[type, token]`. Any record that doesn't split into
/// exactly two non-empty parts fails the whole response with `Auth`. An
/// empty list (no records at all) also fails, per §8 boundary behavior
/// ("a non-empty valid list yields Ok").
pub fn decode_init_response(bytes: &[u8]) -> SaslOutcome {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => return SaslOutcome::Auth,
    };

    let records: Vec<&str> = text.split('\0').filter(|field| !field.is_empty()).collect();
    if records.is_empty() {
        return SaslOutcome::Auth;
    }

    let mut tokens = Vec::with_capacity(records.len());
    for record in records {
        match record.split_once(' ') {
            Some((token_type, token)) if !token_type.is_empty() && !token.is_empty() => {
                tokens.push(SaslToken::new(token_type, token));
            }
            _ => return SaslOutcome::Auth,
        }
    }
    SaslOutcome::Ok(tokens)
}

/// SASL security-layer upgrade after negotiation: a no-op for this
/// mechanism — `AMQPCBS` carries no transport-level framing of its own
/// (§4.5 "Transport upgrade is a no-op").
pub fn upgrade_transport() {}
