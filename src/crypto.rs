//! # Message Authentication and Payload Encryption
//!
//! This module provides the cryptographic operations the wire layer consumes:
//!
//! - **Signatures**: Ed25519 over every byte after the signature field
//! - **Sealing**: one-shot public-key encryption of payloads to a recipient
//!
//! ## Sealed Payload Format
//!
//! ```text
//! ephemeral X25519 public key (32) || ChaCha20-Poly1305 ciphertext + tag
//! ```
//!
//! The recipient's Ed25519 key is mapped to its Montgomery form, an ephemeral
//! X25519 agreement produces the shared secret, and BLAKE3 in key-derivation
//! mode binds the secret to both public keys. Each derived key encrypts exactly
//! one payload, so a fixed nonce is safe.
//!
//! ## Failure Semantics
//!
//! Callers treat every [`AuthError`] on an inbound message as a silent drop.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::Signature;
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use crate::identity::{Address, Keypair, SIGNATURE_LEN};
use crate::wire::RawMessage;

// ============================================================================
// Authentication Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidSignatureLength,
    /// Cryptographic verification failed.
    SignatureVerificationFailed,
    /// The address does not decode to a valid Ed25519 public key.
    InvalidPublicKey,
    /// Sealing the payload failed.
    EncryptionFailed,
    /// The payload was not sealed to this node or was tampered with.
    DecryptionError,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidSignatureLength => write!(f, "signature has invalid length"),
            AuthError::SignatureVerificationFailed => write!(f, "signature verification failed"),
            AuthError::InvalidPublicKey => write!(f, "invalid public key"),
            AuthError::EncryptionFailed => write!(f, "payload encryption failed"),
            AuthError::DecryptionError => write!(f, "payload decryption failed"),
        }
    }
}

impl std::error::Error for AuthError {}

// ============================================================================
// Signatures
// ============================================================================

pub fn verify_signature(signer: &Address, data: &[u8], signature: &[u8]) -> Result<(), AuthError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(AuthError::InvalidSignatureLength);
    }
    let verifying_key = signer.verifying_key().ok_or(AuthError::InvalidPublicKey)?;
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| AuthError::InvalidSignatureLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(data, &sig)
        .map_err(|_| AuthError::SignatureVerificationFailed)
}

/// Check a decoded message's signature against its `from` address.
pub fn verify(message: &RawMessage) -> bool {
    verify_signature(&message.from, &message.signed, &message.signature).is_ok()
}

/// Proof attached to CHANGE_KEY: the new key signs the old address.
pub fn key_change_proof(new_keypair: &Keypair, old_address: &Address) -> [u8; SIGNATURE_LEN] {
    new_keypair.sign(old_address.as_bytes())
}

pub fn verify_key_change(
    old_address: &Address,
    new_address: &Address,
    proof: &[u8],
) -> Result<(), AuthError> {
    verify_signature(new_address, old_address.as_bytes(), proof)
}

// ============================================================================
// Sealing
// ============================================================================

/// BLAKE3 key-derivation context for payload keys.
const SEAL_KEY_CONTEXT: &str = "kadmesh 2024-06 sealed payload key v1";

const EPHEMERAL_KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Bytes a sealed payload adds on top of the plaintext.
pub const SEAL_OVERHEAD: usize = EPHEMERAL_KEY_LEN + TAG_LEN;

fn payload_cipher(
    shared: &[u8; 32],
    ephemeral: &[u8; 32],
    recipient: &[u8; 32],
) -> ChaCha20Poly1305 {
    let mut material = [0u8; 96];
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral);
    material[64..].copy_from_slice(recipient);
    let key = blake3::derive_key(SEAL_KEY_CONTEXT, &material);
    ChaCha20Poly1305::new(&key.into())
}

/// Encrypt `plaintext` so that only the holder of `recipient`'s key can read it.
pub fn seal(recipient: &Address, plaintext: &[u8]) -> Result<Vec<u8>, AuthError> {
    let verifying_key = recipient.verifying_key().ok_or(AuthError::InvalidPublicKey)?;
    let recipient_public = X25519PublicKey::from(verifying_key.to_montgomery().to_bytes());

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_public);
    if !shared.was_contributory() {
        return Err(AuthError::InvalidPublicKey);
    }

    let cipher = payload_cipher(
        shared.as_bytes(),
        ephemeral_public.as_bytes(),
        recipient_public.as_bytes(),
    );
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
        .map_err(|_| AuthError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(EPHEMERAL_KEY_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a payload sealed to `keypair`.
pub fn open(keypair: &Keypair, sealed: &[u8]) -> Result<Vec<u8>, AuthError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(AuthError::DecryptionError);
    }
    let (ephemeral_bytes, ciphertext) = sealed.split_at(EPHEMERAL_KEY_LEN);
    let ephemeral_bytes: [u8; EPHEMERAL_KEY_LEN] = ephemeral_bytes
        .try_into()
        .map_err(|_| AuthError::DecryptionError)?;
    let ephemeral_public = X25519PublicKey::from(ephemeral_bytes);

    let secret = StaticSecret::from(keypair.x25519_secret_bytes());
    let own_public = X25519PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(AuthError::DecryptionError);
    }

    let cipher = payload_cipher(shared.as_bytes(), &ephemeral_bytes, own_public.as_bytes());
    cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
        .map_err(|_| AuthError::DecryptionError)
}

/// Return the plaintext payload of `message`, opening it if it was sealed.
pub fn decrypt_if_needed(message: &RawMessage, keypair: &Keypair) -> Result<Vec<u8>, AuthError> {
    if !message.encrypted {
        return Ok(message.payload.to_vec());
    }
    if message.to != keypair.address() {
        return Err(AuthError::DecryptionError);
    }
    open(keypair, &message.payload)
}
