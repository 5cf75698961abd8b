// ============================
// crates/backend-lib/src/code_gen.rs
// ============================
//! Join-code generation.
//!
//! Codes are drawn from an alphabet without visually confusable characters
//! (no `0`/`O`, no `1`/`I`).

use chrono::Utc;
use rand::Rng;

/// Characters a join code may contain
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default code length
pub const DEFAULT_CODE_LENGTH: usize = 6;

/// Default number of random draws before falling back
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

/// Upper bound on fallback candidates tried before giving up
const MAX_FALLBACK_ATTEMPTS: u64 = 64;

/// Generator for fixed-length join codes
#[derive(Debug, Clone)]
pub struct CodeGenerator {
    length: usize,
    max_attempts: usize,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_LENGTH, DEFAULT_MAX_ATTEMPTS)
    }
}

impl CodeGenerator {
    pub fn new(length: usize, max_attempts: usize) -> Self {
        Self {
            length,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Draw one code from the thread-local CSPRNG
    pub fn generate(&self) -> String {
        let mut rng = rand::rng();
        (0..self.length)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect()
    }

    /// Retry `generate` until `is_taken` rejects nothing, or give up after
    /// `max_attempts` draws.
    pub fn generate_unique<F>(&self, is_taken: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        (0..self.max_attempts)
            .map(|_| self.generate())
            .find(|code| !is_taken(code))
    }

    /// Timestamp-derived code used when random draws keep colliding.
    /// Walks forward from the current millisecond until a free code is found.
    pub fn fallback<F>(&self, is_taken: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        let base = Utc::now().timestamp_millis().unsigned_abs();
        (0..MAX_FALLBACK_ATTEMPTS)
            .map(|offset| self.encode(base.wrapping_add(offset)))
            .find(|code| !is_taken(code))
    }

    /// Base-32 encode the low bits of `value` into a code, least significant last
    fn encode(&self, mut value: u64) -> String {
        let radix = CODE_ALPHABET.len() as u64;
        let mut out = vec![CODE_ALPHABET[0]; self.length];
        for slot in out.iter_mut().rev() {
            *slot = CODE_ALPHABET[(value % radix) as usize];
            value /= radix;
        }
        String::from_utf8(out).unwrap_or_default()
    }
}
