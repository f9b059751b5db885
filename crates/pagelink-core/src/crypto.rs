//! Cryptographic utilities for PageLink
//!
//! Provides:
//! - BLAKE3 fingerprints for certificate pinning
//! - Random session tokens exchanged during signaling

/// Size of a session token in bytes
pub const SESSION_TOKEN_LEN: usize = 16;

/// Random token binding an answer to the connection that presents it
pub type SessionToken = [u8; SESSION_TOKEN_LEN];

/// Compute BLAKE3 checksum of data
pub fn checksum(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Generate a random session token
pub fn try_generate_session_token() -> Result<SessionToken, getrandom::Error> {
    let mut token = [0u8; SESSION_TOKEN_LEN];
    getrandom::getrandom(&mut token)?;
    Ok(token)
}

/// Parse a hex-encoded 32-byte fingerprint
pub fn parse_fingerprint(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str.trim()).ok()?;
    bytes.try_into().ok()
}

/// Parse a hex-encoded session token
pub fn parse_session_token(hex_str: &str) -> Option<SessionToken> {
    let bytes = hex::decode(hex_str.trim()).ok()?;
    bytes.try_into().ok()
}
