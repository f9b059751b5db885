//! QUIC networking layer
//!
//! Endpoint construction, certificate pinning and stream framing used by
//! the QUIC transport backend.
//!
//! # Security
//!
//! The offering peer generates a self-signed certificate per session and
//! publishes its BLAKE3 fingerprint in the offer string. The answering peer
//! pins that fingerprint: a server presenting any other certificate is
//! rejected during the handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig, VarInt};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tracing::{debug, info, warn};

use pagelink_core::{
    deserialize_frame, serialize_frame, NetworkConfig, ProtocolError, StreamFrame, MAX_FRAME_SIZE,
};

/// Server name presented during the handshake; identity comes from pinning
pub const SERVER_NAME: &str = "pagelink";

/// Maximum concurrent channels per direction
pub const MAX_CONCURRENT_STREAMS: u32 = 256;

/// Certificate fingerprint - BLAKE3 hash of DER-encoded certificate
pub type CertFingerprint = [u8; 32];

/// Network errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("endpoint error: {0}")]
    Endpoint(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Send a frame on a stream
pub async fn send_frame(stream: &mut SendStream, frame: &StreamFrame) -> Result<(), NetError> {
    let data = serialize_frame(frame)?;
    stream
        .write_all(&data)
        .await
        .map_err(|e| NetError::Send(e.to_string()))?;
    Ok(())
}

/// Receive a frame from a stream
///
/// Returns `Ok(None)` when the remote finished the stream on a frame boundary.
pub async fn recv_frame(stream: &mut RecvStream) -> Result<Option<StreamFrame>, NetError> {
    // Read length prefix
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(quinn::ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(e) => return Err(NetError::Receive(e.to_string())),
    }

    let len = u32::from_le_bytes(len_buf) as usize;

    // Validate length
    if len > MAX_FRAME_SIZE {
        return Err(NetError::Protocol(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        }));
    }

    // Read payload
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetError::Receive(e.to_string()))?;

    Ok(Some(deserialize_frame(&payload)?))
}

/// Generate a self-signed certificate
pub fn generate_self_signed_cert(
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), NetError> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])
        .map_err(|e| NetError::Certificate(e.to_string()))?;
    let key_der = cert.get_key_pair().serialize_der();
    let cert_der = cert
        .serialize_der()
        .map_err(|e| NetError::Certificate(e.to_string()))?;
    let key = PrivatePkcs8KeyDer::from(key_der).into();
    Ok((vec![CertificateDer::from(cert_der)], key))
}

/// Compute BLAKE3 fingerprint of a certificate
pub fn compute_cert_fingerprint(cert: &CertificateDer<'_>) -> CertFingerprint {
    pagelink_core::crypto::checksum(cert.as_ref())
}

/// Transport parameters derived from the network configuration
///
/// Keep-alives hold NAT mappings open; the idle timeout is what eventually
/// reports a silent peer as disconnected.
pub fn create_transport_config(network: &NetworkConfig) -> TransportConfig {
    let mut transport = TransportConfig::default();

    transport.keep_alive_interval(Some(Duration::from_secs(network.keepalive_secs)));
    transport.max_idle_timeout(Duration::from_secs(network.idle_timeout_secs).try_into().ok());
    transport.initial_rtt(Duration::from_millis(100));

    // One bidirectional stream per data channel
    transport.max_concurrent_bidi_streams(VarInt::from_u32(MAX_CONCURRENT_STREAMS));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    transport
}

/// Create a QUIC client endpoint with certificate pinning
pub fn create_client_endpoint_with_pinned_cert(
    network: &NetworkConfig,
    expected_fingerprint: CertFingerprint,
) -> Result<Endpoint, NetError> {
    debug!(
        "Creating client endpoint with pinned cert: {}",
        hex::encode(expected_fingerprint)
    );
    let bind_addr = SocketAddr::new(network.bind, 0);
    let mut endpoint =
        Endpoint::client(bind_addr).map_err(|e| NetError::Endpoint(e.to_string()))?;

    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier::new(expected_fingerprint)))
        .with_no_client_auth();

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| NetError::Certificate(e.to_string()))?;
    let mut config = ClientConfig::new(Arc::new(quic_crypto));
    config.transport_config(Arc::new(create_transport_config(network)));

    endpoint.set_default_client_config(config);
    Ok(endpoint)
}

/// Create a QUIC server endpoint
///
/// Returns the endpoint along with its certificate fingerprint, which the
/// answering peer pins.
pub fn create_server_endpoint(
    network: &NetworkConfig,
) -> Result<(Endpoint, CertFingerprint), NetError> {
    let (certs, key) = generate_self_signed_cert()?;
    let fingerprint = compute_cert_fingerprint(&certs[0]);

    let crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::Certificate(e.to_string()))?;

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| NetError::Certificate(e.to_string()))?;
    let mut config = ServerConfig::with_crypto(Arc::new(quic_crypto));
    config.transport_config(Arc::new(create_transport_config(network)));

    let endpoint = Endpoint::server(config, network.bind_addr())
        .map_err(|e| NetError::Endpoint(e.to_string()))?;

    info!(
        "Server endpoint on {:?} with cert fingerprint: {}",
        endpoint.local_addr().ok(),
        hex::encode(fingerprint)
    );
    Ok((endpoint, fingerprint))
}

/// Connect to the first reachable candidate address
pub async fn connect_any(
    endpoint: &Endpoint,
    candidates: &[SocketAddr],
    timeout: Duration,
) -> Result<quinn::Connection, NetError> {
    let mut last_error = NetError::Connect("no candidate addresses".into());

    for addr in candidates {
        debug!("Trying candidate {}", addr);
        let connecting = match endpoint.connect(*addr, SERVER_NAME) {
            Ok(connecting) => connecting,
            Err(e) => {
                last_error = NetError::Connect(e.to_string());
                continue;
            }
        };
        match tokio::time::timeout(timeout, connecting).await {
            Ok(Ok(connection)) => {
                info!("Connected to {}", addr);
                return Ok(connection);
            }
            Ok(Err(e)) => {
                warn!("Candidate {} failed: {}", addr, e);
                last_error = NetError::Connect(e.to_string());
            }
            Err(_) => {
                warn!("Candidate {} timed out", addr);
                last_error = NetError::Connect(format!("{} timed out", addr));
            }
        }
    }

    Err(last_error)
}

/// Certificate pinning verifier - validates server cert matches expected fingerprint
///
/// Handshake signatures are still checked, so a peer must hold the pinned
/// certificate's private key and not merely present the certificate.
#[derive(Debug)]
struct PinnedCertVerifier {
    expected_fingerprint: CertFingerprint,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    fn new(expected_fingerprint: CertFingerprint) -> Self {
        Self {
            expected_fingerprint,
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let actual_fingerprint = compute_cert_fingerprint(end_entity);

        if actual_fingerprint == self.expected_fingerprint {
            debug!("Certificate fingerprint verified: {}", hex::encode(actual_fingerprint));
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            warn!(
                "Certificate fingerprint mismatch! Expected: {}, Got: {}",
                hex::encode(self.expected_fingerprint),
                hex::encode(actual_fingerprint)
            );
            Err(rustls::Error::General("certificate fingerprint mismatch".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_generation() {
        let (certs, _key) = generate_self_signed_cert().unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_fingerprints_differ_per_cert() {
        let (a, _) = generate_self_signed_cert().unwrap();
        let (b, _) = generate_self_signed_cert().unwrap();
        assert_ne!(compute_cert_fingerprint(&a[0]), compute_cert_fingerprint(&b[0]));
    }

    #[test]
    fn test_pinned_verifier_rejects_other_cert() {
        use rustls::client::danger::ServerCertVerifier;

        let (certs, _) = generate_self_signed_cert().unwrap();
        let good = PinnedCertVerifier::new(compute_cert_fingerprint(&certs[0]));
        let bad = PinnedCertVerifier::new([0u8; 32]);
        let name = rustls::pki_types::ServerName::try_from(SERVER_NAME).unwrap();
        let now = rustls::pki_types::UnixTime::now();

        assert!(good.verify_server_cert(&certs[0], &[], &name, &[], now).is_ok());
        assert!(bad.verify_server_cert(&certs[0], &[], &name, &[], now).is_err());
    }

    #[test]
    fn test_pinned_verifier_schemes_match_provider() {
        use rustls::client::danger::ServerCertVerifier;

        let verifier = PinnedCertVerifier::new([0u8; 32]);
        let schemes = verifier.supported_verify_schemes();
        assert!(schemes.contains(&rustls::SignatureScheme::ECDSA_NISTP256_SHA256));
        assert!(schemes.contains(&rustls::SignatureScheme::ED25519));
    }

    #[tokio::test]
    async fn test_pinned_handshake_over_loopback() {
        let network = NetworkConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..Default::default()
        };
        let (server, fingerprint) = create_server_endpoint(&network).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            while let Some(incoming) = server.accept().await {
                if let Ok(connection) = incoming.await {
                    // Hold the connection open until the client goes away
                    let _ = connection.closed().await;
                }
            }
        });

        let client = create_client_endpoint_with_pinned_cert(&network, fingerprint).unwrap();
        let connection = connect_any(&client, &[addr], Duration::from_secs(5)).await;
        assert!(connection.is_ok(), "{:?}", connection.err());

        let wrong = create_client_endpoint_with_pinned_cert(&network, [7u8; 32]).unwrap();
        let rejected = connect_any(&wrong, &[addr], Duration::from_secs(5)).await;
        assert!(matches!(rejected, Err(NetError::Connect(_))));
    }

    #[tokio::test]
    async fn test_connect_any_without_candidates() {
        let network = NetworkConfig {
            bind: "127.0.0.1".parse().unwrap(),
            ..Default::default()
        };
        let endpoint = create_client_endpoint_with_pinned_cert(&network, [0u8; 32]).unwrap();
        let result = connect_any(&endpoint, &[], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(NetError::Connect(_))));
    }
}
