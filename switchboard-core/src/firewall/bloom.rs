//! PII Bloom pre-filter.
//!
//! A small fixed-size Bloom filter over a compiled marker set lets the
//! firewall skip the PII regex bank entirely for the common case of a
//! clean body. The filter fails open: a positive only escalates to the
//! regex confirmation stage, never denies by itself.

use sha2::{Digest, Sha256};

const BLOOM_BITS: usize = 2048;
const BLOOM_HASHES: u32 = 3;

/// Fixed-size Bloom filter keyed by double SHA-256 hashing.
pub struct BloomFilter {
    bits: Vec<u64>,
}

impl BloomFilter {
    /// Build a filter containing `items`. The set is fixed after build.
    pub fn from_items<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self {
            bits: vec![0u64; BLOOM_BITS / 64],
        };
        for item in items {
            for index in Self::bit_indexes(item.as_ref()) {
                filter.bits[index / 64] |= 1u64 << (index % 64);
            }
        }
        filter
    }

    /// Membership test. False positives possible, false negatives not.
    pub fn contains(&self, item: &str) -> bool {
        Self::bit_indexes(item)
            .into_iter()
            .all(|index| self.bits[index / 64] & (1u64 << (index % 64)) != 0)
    }

    fn bit_indexes(item: &str) -> [usize; BLOOM_HASHES as usize] {
        let digest = Sha256::digest(item.as_bytes());
        let h1 = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        let h2 = u64::from_le_bytes([
            digest[8], digest[9], digest[10], digest[11], digest[12], digest[13], digest[14],
            digest[15],
        ]);
        let mut indexes = [0usize; BLOOM_HASHES as usize];
        for (i, slot) in indexes.iter_mut().enumerate() {
            *slot = (h1.wrapping_add(h2.wrapping_mul(i as u64)) % BLOOM_BITS as u64) as usize;
        }
        indexes
    }
}

/// Word markers that suggest PII or credentials may be present.
const PII_MARKERS: &[&str] = &[
    // Common provider mail domains
    "gmail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "company.com",
    // Keyword prefixes
    "ssn:",
    "ssn",
    "bearer",
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "aws_access_key_id",
];

/// Pre-filter over a serialised body: `false` means the PII regex bank can
/// be skipped outright.
pub struct PiiPrefilter {
    markers: BloomFilter,
}

impl Default for PiiPrefilter {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiPrefilter {
    pub fn new() -> Self {
        Self {
            markers: BloomFilter::from_items(PII_MARKERS),
        }
    }

    /// Whether the text warrants running the PII confirmation regexes.
    pub fn may_contain_pii(&self, text: &str) -> bool {
        for raw in text.split_whitespace() {
            let token = raw.trim_matches(|c: char| matches!(c, '"' | '\'' | ',' | '{' | '}' | '[' | ']'));
            if token.contains('@') {
                return true;
            }
            if has_long_digit_run(token) {
                return true;
            }
            let lowered = token.to_lowercase();
            if lowered.starts_with("sk-")
                || lowered.starts_with("akia")
                || lowered.starts_with("ghp_")
                || lowered.starts_with("aiza")
            {
                return true;
            }
            if self.markers.contains(lowered.trim_end_matches(':')) {
                return true;
            }
            // Markers like "gmail.com" appear embedded in larger tokens.
            if lowered.contains("gmail.com") || lowered.contains("ssn:") {
                return true;
            }
        }
        false
    }
}

/// Four or more consecutive digits: card fragments, SSNs, phone numbers.
fn has_long_digit_run(token: &str) -> bool {
    let mut run = 0;
    for c in token.chars() {
        if c.is_ascii_digit() {
            run += 1;
            if run >= 4 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}
