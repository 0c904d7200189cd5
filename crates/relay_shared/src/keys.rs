//! Key material and session-key derivation.
//!
//! Two shared bootstrap keys are loaded from base64 files at startup: the
//! pre-handshake key every session starts with, and the static post-handshake
//! key of the downstream dialect. The upstream leg rotates to a per-session
//! 4096-byte key derived from a 64-bit seed exchanged during login; the
//! derivation must match the peer bit for bit, so the generator below is a
//! faithful reimplementation, not a substitute from a random-number crate.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

/// Derived session keys are always exactly this long.
pub const SESSION_KEY_LEN: usize = 4096;

const NN: usize = 624;
const MM: usize = 312;
const MATRIX_A: u64 = 0xB502_6F5A_A966_19E9;
const UPPER_MASK: u64 = 0xFFFF_FFFF_8000_0000;
const LOWER_MASK: u64 = 0x0000_0000_7FFF_FFFF;

/// 64-bit Mersenne-Twister-family generator with a 624-word state.
///
/// Uses the canonical MT19937-64 seeding multiplier, twist matrix and
/// tempering shifts over the widened state.
pub struct Mt19937_64 {
    mt: Box<[u64; NN]>,
    mti: usize,
}

impl Mt19937_64 {
    pub fn new(seed: u64) -> Self {
        let mut r#gen = Self {
            mt: Box::new([0; NN]),
            mti: NN + 1,
        };
        r#gen.seed(seed);
        r#gen
    }

    /// Re-initializes the state from a seed.
    pub fn seed(&mut self, seed: u64) {
        self.mt[0] = seed;
        for i in 1..NN {
            self.mt[i] = 6364136223846793005u64
                .wrapping_mul(self.mt[i - 1] ^ (self.mt[i - 1] >> 62))
                .wrapping_add(i as u64);
        }
        self.mti = NN;
    }

    /// Draws the next 64-bit output.
    pub fn next(&mut self) -> u64 {
        if self.mti >= NN {
            self.twist();
        }
        let mut x = self.mt[self.mti];
        self.mti += 1;

        x ^= (x >> 29) & 0x5555_5555_5555_5555;
        x ^= (x << 17) & 0x71D6_7FFF_EDA6_0000;
        x ^= (x << 37) & 0xFFF7_EEE0_0000_0000;
        x ^= x >> 43;
        x
    }

    fn twist(&mut self) {
        for i in 0..NN {
            let x = (self.mt[i] & UPPER_MASK) | (self.mt[(i + 1) % NN] & LOWER_MASK);
            let mut y = x >> 1;
            if x & 1 != 0 {
                y ^= MATRIX_A;
            }
            self.mt[i] = self.mt[(i + MM) % NN] ^ y;
        }
        self.mti = 0;
    }
}

/// Derives the 4096-byte per-session key from the exchanged seed.
///
/// Ordering matters for interoperability: seed, reseed with the first
/// output, discard one warm-up draw, then emit 512 big-endian words.
pub fn derive_session_key(seed: u64) -> Vec<u8> {
    let mut r#gen = Mt19937_64::new(seed);
    let reseed = r#gen.next();
    r#gen.seed(reseed);
    r#gen.next(); // warm-up draw, discarded

    let mut key = Vec::with_capacity(SESSION_KEY_LEN);
    for _ in 0..SESSION_KEY_LEN / 8 {
        key.extend_from_slice(&r#gen.next().to_be_bytes());
    }
    key
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("key file {path} is not valid base64: {source}")]
    Base64 {
        path: String,
        source: base64::DecodeError,
    },
}

/// The two configured bootstrap key blobs.
#[derive(Clone, Debug)]
pub struct KeySet {
    /// Shared pre-handshake key; every session starts with it on both legs.
    pub initial: Arc<Vec<u8>>,
    /// Static post-handshake key of the downstream dialect.
    pub post: Arc<Vec<u8>>,
}

impl KeySet {
    pub fn load(initial: &Path, post: &Path) -> Result<Self, KeyError> {
        Ok(Self {
            initial: Arc::new(load_b64(initial)?),
            post: Arc::new(load_b64(post)?),
        })
    }

    /// Builds a key set from raw bytes; used by tests and tools.
    pub fn from_raw(initial: Vec<u8>, post: Vec<u8>) -> Self {
        Self {
            initial: Arc::new(initial),
            post: Arc::new(post),
        }
    }
}

fn load_b64(path: &Path) -> Result<Vec<u8>, KeyError> {
    let text = fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.display().to_string(),
        source,
    })?;
    BASE64
        .decode(text.trim())
        .map_err(|source| KeyError::Base64 {
            path: path.display().to_string(),
            source,
        })
}
