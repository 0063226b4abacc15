//! AES-256 counter-mode stream cipher
//!
//! The keystream for block `i` is `AES(key, nonce + i)` where `nonce` is the
//! header's 16-byte initial counter block read as a big-endian 128-bit
//! integer and the addition wraps. Ciphertext is `plaintext XOR keystream`,
//! so the same transform encrypts and decrypts. There is no padding: a short
//! final block consumes only the keystream prefix it needs.

use crate::header::NONCE_LEN;
use crate::kdf::DerivedKey;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// AES block size in bytes
pub const BLOCK_LEN: usize = 16;

/// Position in the keystream of one container.
///
/// Tracks the byte offset rather than just the block index, so that chunks
/// which are not a multiple of [`BLOCK_LEN`] can be fed in sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterState {
    nonce: [u8; NONCE_LEN],
    position: u64,
}

impl CounterState {
    /// State for the first ciphertext byte
    pub fn new(nonce: [u8; NONCE_LEN]) -> Self {
        Self::at_offset(nonce, 0)
    }

    /// State for resuming at byte `offset` of the ciphertext
    pub fn at_offset(nonce: [u8; NONCE_LEN], offset: u64) -> Self {
        Self {
            nonce,
            position: offset,
        }
    }

    /// Byte offset into the ciphertext
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Counter block that produces the keystream at the current position
    pub fn counter_block(&self) -> [u8; BLOCK_LEN] {
        let block_index = u128::from(self.position / BLOCK_LEN as u64);
        u128::from_be_bytes(self.nonce)
            .wrapping_add(block_index)
            .to_be_bytes()
    }
}

/// Stateful cipher for sequential chunk processing.
pub struct CtrStream {
    cipher: Aes256Ctr,
    state: CounterState,
}

impl CtrStream {
    pub fn new(key: &DerivedKey, state: CounterState) -> Self {
        let mut cipher = Aes256Ctr::new(key.expose_secret().into(), (&state.nonce).into());
        cipher.seek(state.position);
        Self { cipher, state }
    }

    /// XOR the next `buf.len()` keystream bytes into `buf` in place.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
        self.state.position += buf.len() as u64;
    }

    pub fn state(&self) -> CounterState {
        self.state
    }
}

/// Decrypt one chunk starting at `state`.
///
/// Returns the plaintext and the state for the chunk that immediately
/// follows. Chunks must be supplied in order; skipping or reordering them
/// requires building the matching state with [`CounterState::at_offset`].
pub fn decrypt_chunk(
    key: &DerivedKey,
    state: CounterState,
    ciphertext: &[u8],
) -> (Vec<u8>, CounterState) {
    let mut stream = CtrStream::new(key, state);
    let mut plaintext = ciphertext.to_vec();
    stream.apply(&mut plaintext);
    (plaintext, stream.state())
}
