//! The Crypter interface (spec §2 `crypto`).
//!
//! `Crypter` is an opaque per-record encrypt/decrypt boundary plus a
//! channel-binding hook used during the VC handshake. Concrete
//! realizations beyond the null transform (TLS, NaCl-box) are external
//! collaborators — this crate defines the trait and a loopback-safe
//! default impl only.

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoError(pub String);

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "crypter error: {}", self.0)
    }
}

impl std::error::Error for CryptoError {}

/// Opaque per-record encryption boundary. A VC's crypter is installed once
/// the handshake completes (spec §4.3) and is used on every `Data` payload
/// thereafter: bytes encrypted together are decrypted together as one
/// record (spec §3 invariant).
pub trait Crypter: Send + Sync + 'static {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Bytes, CryptoError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Bytes, CryptoError>;

    /// Bytes that uniquely identify this encrypted channel, used to bind
    /// the blessing exchange to the specific TLS/NaCl-box session so a
    /// MITM can't replay a handshake over a different channel.
    fn channel_binding(&self) -> Bytes;
}

/// The identity transform: used for loopback/testing and for the in-memory
/// transport, where the underlying stream is already private. Per spec §9,
/// TLS session resumption across reconnects is never attempted by any
/// realization of this trait (including this one) — every VC handshake
/// re-runs from scratch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCrypter;

impl Crypter for NullCrypter {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(Bytes::copy_from_slice(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(Bytes::copy_from_slice(ciphertext))
    }

    fn channel_binding(&self) -> Bytes {
        Bytes::new()
    }
}
