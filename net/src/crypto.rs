//! The optional per-datagram obfuscation codec: spec.md §4.4.
//!
//! Every encrypted datagram is `nonce(16) | md5(plaintext)(16) | plaintext`,
//! the whole of which is run through a hand-rolled AES-128 CFB-like stream
//! cipher keyed by `SHA-256(key)[..16]` with a fixed IV. This is obfuscation
//! against a casual observer, not an authenticated cipher: an attacker who
//! can see the fixed IV and chosen-plaintext can recover the keystream.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use md5::{Digest, Md5};
use sha2::Sha256;

const BLOCK_SIZE: usize = 16;
const NONCE_SIZE: usize = 16;
const CHECKSUM_SIZE: usize = 16;
/// Bytes of framing this codec adds ahead of the KCP payload.
pub const OVERHEAD: usize = NONCE_SIZE + CHECKSUM_SIZE;

/// A fixed initialization vector. The construction is not claimed to be
/// secure against a chosen-plaintext adversary; see spec's open question on
/// this point.
const IV: [u8; BLOCK_SIZE] = *b"arq-static-ivxx!";

pub struct Codec {
    cipher: Aes128,
}

impl Codec {
    pub fn new(key: &[u8]) -> Self {
        let digest = Sha256::digest(key);
        let key_bytes = GenericArray::from_slice(&digest[..BLOCK_SIZE]);
        Self {
            cipher: Aes128::new(key_bytes),
        }
    }

    /// Prepends a nonce and an MD5 checksum of `plaintext` to it, then
    /// encrypts the whole buffer in place, returning the wire datagram.
    pub fn encrypt(&self, plaintext: &[u8], nonce: [u8; NONCE_SIZE]) -> Vec<u8> {
        let checksum = Md5::digest(plaintext);

        let mut framed = Vec::with_capacity(OVERHEAD + plaintext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&checksum);
        framed.extend_from_slice(plaintext);

        self.cfb_encrypt(&mut framed);
        framed
    }

    /// Reverses [`Codec::encrypt`]. Returns `None` if `datagram` is shorter
    /// than the framing overhead or the recomputed checksum mismatches.
    pub fn decrypt(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        if datagram.len() < OVERHEAD {
            return None;
        }

        let mut buf = datagram.to_vec();
        self.cfb_decrypt(&mut buf);

        let checksum = &buf[NONCE_SIZE..OVERHEAD];
        let plaintext = &buf[OVERHEAD..];
        let recomputed = Md5::digest(plaintext);

        if checksum != recomputed.as_slice() {
            return None;
        }

        Some(plaintext.to_vec())
    }

    /// CFB-style keystream XOR, chained from `IV`: block `i`'s keystream is
    /// `AES_encrypt(ciphertext block i-1)`. Plaintext in, ciphertext out.
    fn cfb_encrypt(&self, buf: &mut [u8]) {
        let mut prev = IV;
        for block in buf.chunks_mut(BLOCK_SIZE) {
            let mut keystream = GenericArray::clone_from_slice(&prev);
            self.cipher.encrypt_block(&mut keystream);

            for (i, byte) in block.iter_mut().enumerate() {
                *byte ^= keystream[i];
            }

            let mut next_prev = [0u8; BLOCK_SIZE];
            next_prev[..block.len()].copy_from_slice(block);
            prev = next_prev;
        }
    }

    /// Inverse of [`Codec::cfb_encrypt`]. Ciphertext in, plaintext out; the
    /// chaining value is the ciphertext block, captured before it is
    /// overwritten with plaintext.
    fn cfb_decrypt(&self, buf: &mut [u8]) {
        let mut prev = IV;
        for block in buf.chunks_mut(BLOCK_SIZE) {
            let mut keystream = GenericArray::clone_from_slice(&prev);
            self.cipher.encrypt_block(&mut keystream);

            let mut next_prev = [0u8; BLOCK_SIZE];
            next_prev[..block.len()].copy_from_slice(block);
            prev = next_prev;

            for (i, byte) in block.iter_mut().enumerate() {
                *byte ^= keystream[i];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_short_message() {
        let codec = Codec::new(b"shared-secret");
        let wire = codec.encrypt(b"hello, world", [7u8; NONCE_SIZE]);
        let plaintext = codec.decrypt(&wire).unwrap();
        assert_eq!(plaintext, b"hello, world");
    }

    #[test]
    fn round_trips_a_multi_block_message() {
        let codec = Codec::new(b"another-key");
        let payload = vec![0x5Au8; 1000];
        let wire = codec.encrypt(&payload, [3u8; NONCE_SIZE]);
        let plaintext = codec.decrypt(&wire).unwrap();
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn mismatched_key_fails_to_decrypt() {
        let sender = Codec::new(b"key-one");
        let receiver = Codec::new(b"key-two");
        let wire = sender.encrypt(b"payload", [1u8; NONCE_SIZE]);
        assert!(receiver.decrypt(&wire).is_none());
    }

    #[test]
    fn a_single_mutated_byte_is_detected() {
        let codec = Codec::new(b"shared-secret");
        let mut wire = codec.encrypt(b"integrity matters", [2u8; NONCE_SIZE]);
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(codec.decrypt(&wire).is_none());
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        let codec = Codec::new(b"shared-secret");
        assert!(codec.decrypt(&[0u8; OVERHEAD - 1]).is_none());
    }
}
