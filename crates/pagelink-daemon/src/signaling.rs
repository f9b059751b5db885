//! Offer/answer description strings
//!
//! Descriptions are JSON documents, hex-encoded so they survive being
//! copied through chat windows and terminals untouched. The offer carries
//! the offering peer's candidate addresses and certificate fingerprint; the
//! answer carries the session token the answering peer will present.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use pagelink_core::crypto::{parse_fingerprint, parse_session_token, SessionToken};
use pagelink_core::PROTOCOL_VERSION;

use crate::net::{CertFingerprint, NetError};

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("malformed description: {0}")]
    Malformed(String),

    #[error("protocol version mismatch (expected {expected}, got {actual})")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("{0}")]
    WrongState(&'static str),

    #[error("random source unavailable: {0}")]
    Random(String),

    #[error(transparent)]
    Net(#[from] NetError),
}

/// Description produced by `create_offer`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferDescription {
    pub version: u32,
    /// Hex-encoded certificate fingerprint
    pub fingerprint: String,
    pub candidates: Vec<SocketAddr>,
}

impl OfferDescription {
    pub fn new(fingerprint: CertFingerprint, candidates: Vec<SocketAddr>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            fingerprint: hex::encode(fingerprint),
            candidates,
        }
    }

    pub fn fingerprint(&self) -> Result<CertFingerprint, SignalingError> {
        parse_fingerprint(&self.fingerprint)
            .ok_or_else(|| SignalingError::Malformed("invalid certificate fingerprint".into()))
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        encode_description(self)
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        let offer: Self = decode_description(text)?;
        check_version(offer.version)?;
        if offer.candidates.is_empty() {
            return Err(SignalingError::Malformed("offer has no candidates".into()));
        }
        Ok(offer)
    }
}

/// Description produced by `accept_offer`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerDescription {
    pub version: u32,
    /// Hex-encoded session token
    pub token: String,
}

impl AnswerDescription {
    pub fn new(token: SessionToken) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            token: hex::encode(token),
        }
    }

    pub fn token(&self) -> Result<SessionToken, SignalingError> {
        parse_session_token(&self.token)
            .ok_or_else(|| SignalingError::Malformed("invalid session token".into()))
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        encode_description(self)
    }

    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        let answer: Self = decode_description(text)?;
        check_version(answer.version)?;
        Ok(answer)
    }
}

fn check_version(actual: u32) -> Result<(), SignalingError> {
    if actual != PROTOCOL_VERSION {
        return Err(SignalingError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual,
        });
    }
    Ok(())
}

fn encode_description<T: Serialize>(value: &T) -> Result<String, SignalingError> {
    let json = serde_json::to_vec(value).map_err(|e| SignalingError::Malformed(e.to_string()))?;
    Ok(hex::encode(json))
}

fn decode_description<T: DeserializeOwned>(text: &str) -> Result<T, SignalingError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let json = hex::decode(compact).map_err(|e| SignalingError::Malformed(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| SignalingError::Malformed(e.to_string()))
}

/// Addresses the answering peer can try, for an endpoint bound to `bind`
pub fn local_candidates(bind: IpAddr, port: u16) -> Vec<SocketAddr> {
    if !bind.is_unspecified() {
        return vec![SocketAddr::new(bind, port)];
    }

    let mut addrs = Vec::new();

    // Routing table lookup via a connected UDP socket; nothing is sent
    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(local) = socket.local_addr() {
                addrs.push(SocketAddr::new(local.ip(), port));
            }
        }
    }

    let loopback = SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port);
    if !addrs.contains(&loopback) {
        addrs.push(loopback);
    }

    debug!("Local candidates: {:?}", addrs);
    addrs
}
