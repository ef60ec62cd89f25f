//! Obfuscated storage and runtime reassembly of the server public key.
//!
//! The client ships the server's PEM public key as shuffled, noise-padded
//! fragments encoded with a permuted 64-symbol alphabet. Each fragment
//! carries an AES-GCM encrypted marker recording its position and noise
//! lengths. This only raises the cost of static extraction. The trust
//! boundary is the server private key: an envelope sealed under any other
//! public key fails at key unwrap.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use rand::Rng;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CryptoError;
use crate::hybrid::public_key_from_pem;
use crate::kdf;
use crate::session::{NONCE_SIZE, SessionKey};

/// Base alphabet before seeding.
const BASE_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Seed compiled into clients that embed fragments.
pub const DEFAULT_FRAGMENT_SEED: &[u8] = b"benchseal-public-key-fragments-v1";

/// Default number of fragments produced by `benchseal fragments`.
pub const DEFAULT_FRAGMENT_COUNT: usize = 8;

const FRAGMENT_SALT: &[u8] = b"benchseal-fragment-codec";
const ALPHABET_INFO: &[u8] = b"fragment_alphabet";
const MARKER_INFO: &[u8] = b"fragment_marker";

/// Upper bound on noise symbols on each side of a fragment.
const MAX_NOISE: usize = 24;

const INVALID: u8 = 0xFF;

/// One shuffled, noise-padded slice of the encoded public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscatedKeyFragment {
    pub data: String,
    pub marker: String,
}

/// Encodes and decodes key fragments for one seed.
pub struct FragmentCodec {
    alphabet: [u8; 64],
    decode: [u8; 256],
    marker_key: SessionKey,
}

impl std::fmt::Debug for FragmentCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentCodec")
            .field("marker_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl FragmentCodec {
    /// Build a codec from a seed of at least 16 bytes.
    ///
    /// The alphabet permutation and marker key are both derived from the seed,
    /// so encoder and decoder only need to agree on it.
    pub fn new(seed: &[u8]) -> Result<Self, CryptoError> {
        let stream = kdf::derive(seed, FRAGMENT_SALT, ALPHABET_INFO, 128)?;
        let mut alphabet = *BASE_ALPHABET;
        for i in (1..alphabet.len()).rev() {
            let r = u16::from_be_bytes([stream[2 * i], stream[2 * i + 1]]);
            let j = usize::from(r) % (i + 1);
            alphabet.swap(i, j);
        }

        let mut decode = [INVALID; 256];
        for (&c, i) in alphabet.iter().zip(0u8..) {
            decode[usize::from(c)] = i;
        }

        let marker_bytes = kdf::derive_key(seed, FRAGMENT_SALT, MARKER_INFO)?;
        let marker_key = SessionKey::from_slice(marker_bytes.as_slice())?;

        Ok(Self {
            alphabet,
            decode,
            marker_key,
        })
    }

    /// Codec for [`DEFAULT_FRAGMENT_SEED`].
    pub fn with_default_seed() -> Result<Self, CryptoError> {
        Self::new(DEFAULT_FRAGMENT_SEED)
    }

    /// Unpadded radix-64 encoding over the permuted alphabet.
    pub fn encode(&self, data: &[u8]) -> String {
        let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
        for chunk in data.chunks(3) {
            let b0 = u32::from(chunk[0]);
            let b1 = u32::from(chunk.get(1).copied().unwrap_or(0));
            let b2 = u32::from(chunk.get(2).copied().unwrap_or(0));
            let n = (b0 << 16) | (b1 << 8) | b2;

            out.push(self.symbol(n >> 18));
            out.push(self.symbol(n >> 12));
            if chunk.len() > 1 {
                out.push(self.symbol(n >> 6));
            }
            if chunk.len() > 2 {
                out.push(self.symbol(n));
            }
        }
        out
    }

    fn symbol(&self, n: u32) -> char {
        char::from(self.alphabet[(n & 0x3F) as usize])
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(&self, input: &str) -> Result<Vec<u8>, CryptoError> {
        if input.len() % 4 == 1 {
            return Err(CryptoError::Format("invalid fragment encoding length".into()));
        }
        let mut out = Vec::with_capacity(input.len() * 3 / 4);
        for chunk in input.as_bytes().chunks(4) {
            let mut n: u32 = 0;
            for (i, &b) in chunk.iter().enumerate() {
                let v = self.decode[usize::from(b)];
                if v == INVALID {
                    return Err(CryptoError::Format("invalid fragment symbol".into()));
                }
                n |= u32::from(v) << (18 - i * 6);
            }
            let [_, hi, mid, lo] = n.to_be_bytes();
            out.push(hi);
            if chunk.len() > 2 {
                out.push(mid);
            }
            if chunk.len() > 3 {
                out.push(lo);
            }
        }
        Ok(out)
    }

    /// Split `pem` into at most `pieces` shuffled fragments.
    pub fn obfuscate(
        &self,
        pem: &str,
        pieces: usize,
    ) -> Result<Vec<ObfuscatedKeyFragment>, CryptoError> {
        if pieces == 0 {
            return Err(CryptoError::Format("fragment count must be non-zero".into()));
        }
        let encoded = self.encode(pem.as_bytes());
        if encoded.is_empty() {
            return Err(CryptoError::Format("cannot fragment an empty key".into()));
        }

        let chunk_len = encoded.len().div_ceil(pieces);
        let chunks: Vec<&[u8]> = encoded.as_bytes().chunks(chunk_len).collect();
        let total = chunks.len();

        let mut fragments = chunks
            .into_iter()
            .enumerate()
            .map(|(position, chunk)| self.seal_fragment(position, total, chunk))
            .collect::<Result<Vec<_>, _>>()?;
        fragments.shuffle(&mut OsRng);

        debug!(fragments = total, encoded_len = encoded.len(), "Public key obfuscated");
        Ok(fragments)
    }

    fn seal_fragment(
        &self,
        position: usize,
        total: usize,
        chunk: &[u8],
    ) -> Result<ObfuscatedKeyFragment, CryptoError> {
        let prefix = self.noise();
        let suffix = self.noise();

        let mut data = String::with_capacity(prefix.len() + chunk.len() + suffix.len());
        data.push_str(&prefix);
        data.extend(chunk.iter().map(|&b| char::from(b)));
        data.push_str(&suffix);

        let marker = format!("{position}.{total}.{}.{}", prefix.len(), suffix.len());
        let sealed = self.marker_key.encrypt(marker.as_bytes())?;
        let mut raw = Vec::with_capacity(NONCE_SIZE + sealed.ciphertext.len());
        raw.extend_from_slice(&sealed.nonce);
        raw.extend_from_slice(&sealed.ciphertext);

        Ok(ObfuscatedKeyFragment {
            data,
            marker: B64.encode(raw),
        })
    }

    fn noise(&self) -> String {
        let len = OsRng.gen_range(0..=MAX_NOISE);
        (0..len)
            .map(|_| char::from(self.alphabet[OsRng.gen_range(0..self.alphabet.len())]))
            .collect()
    }

    fn open_marker(&self, marker: &str) -> Result<FragmentMarker, CryptoError> {
        let raw = B64.decode(marker)?;
        if raw.len() <= NONCE_SIZE {
            return Err(CryptoError::Format("fragment marker too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let plain = self.marker_key.decrypt(ciphertext, nonce)?;
        let text = std::str::from_utf8(&plain)
            .map_err(|_| CryptoError::Format("fragment marker is not UTF-8".into()))?;

        let fields = text
            .split('.')
            .map(str::parse::<usize>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CryptoError::Format("malformed fragment marker".into()))?;
        let [position, total, prefix, suffix] = fields[..] else {
            return Err(CryptoError::Format("malformed fragment marker".into()));
        };
        Ok(FragmentMarker {
            position,
            total,
            prefix,
            suffix,
        })
    }

    /// Reassemble the PEM text from fragments in any order.
    ///
    /// Every failure is fatal: bad marker, missing or duplicate position,
    /// malformed noise bounds or undecodable content.
    pub fn reassemble_pem(&self, fragments: &[ObfuscatedKeyFragment]) -> Result<String, CryptoError> {
        if fragments.is_empty() {
            return Err(CryptoError::Format("no key fragments".into()));
        }

        let mut slots: Vec<Option<&str>> = vec![None; fragments.len()];
        for fragment in fragments {
            let marker = self.open_marker(&fragment.marker)?;
            if marker.total != fragments.len() {
                return Err(CryptoError::Format(format!(
                    "fragment set size mismatch: marker says {}, got {}",
                    marker.total,
                    fragments.len()
                )));
            }
            let data = fragment.data.as_str();
            if !data.is_ascii() || marker.prefix + marker.suffix > data.len() {
                return Err(CryptoError::Format("fragment noise bounds out of range".into()));
            }
            let slot = slots
                .get_mut(marker.position)
                .ok_or_else(|| CryptoError::Format("fragment position out of range".into()))?;
            if slot.is_some() {
                return Err(CryptoError::Format(format!(
                    "duplicate fragment position {}",
                    marker.position
                )));
            }
            *slot = Some(&data[marker.prefix..data.len() - marker.suffix]);
        }

        let encoded: String = slots.into_iter().flatten().collect();
        let bytes = self.decode(&encoded)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Format("reassembled key is not UTF-8".into()))
    }

    /// Reassemble and parse the public key.
    pub fn reassemble(&self, fragments: &[ObfuscatedKeyFragment]) -> Result<RsaPublicKey, CryptoError> {
        let pem = self.reassemble_pem(fragments)?;
        public_key_from_pem(&pem)
    }
}

struct FragmentMarker {
    position: usize,
    total: usize,
    prefix: usize,
    suffix: usize,
}

/// Read a fragment list stored as a JSON array.
pub fn load_fragments(path: &Path) -> Result<Vec<ObfuscatedKeyFragment>, CryptoError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Write a fragment list as a JSON array.
pub fn save_fragments(path: &Path, fragments: &[ObfuscatedKeyFragment]) -> Result<(), CryptoError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(fragments)?)?;
    Ok(())
}

/// Capability handing out the server public key used to wrap session keys.
///
/// Implementations are built once at startup and passed by handle.
pub trait PublicKeySource: Send + Sync {
    fn public_key(&self) -> &RsaPublicKey;
}

/// Public key loaded directly from a PEM file or string.
#[derive(Debug, Clone)]
pub struct PemPublicKey(RsaPublicKey);

impl PemPublicKey {
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        public_key_from_pem(pem).map(Self)
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        Self::from_pem(&std::fs::read_to_string(path)?)
    }
}

impl From<RsaPublicKey> for PemPublicKey {
    fn from(key: RsaPublicKey) -> Self {
        Self(key)
    }
}

impl PublicKeySource for PemPublicKey {
    fn public_key(&self) -> &RsaPublicKey {
        &self.0
    }
}

/// Public key reassembled once from embedded fragments.
#[derive(Debug, Clone)]
pub struct EmbeddedKeyFragments {
    key: RsaPublicKey,
    fragment_count: usize,
}

impl EmbeddedKeyFragments {
    /// Reassemble `fragments` with `codec`; fails rather than falling back.
    pub fn reassemble(
        codec: &FragmentCodec,
        fragments: &[ObfuscatedKeyFragment],
    ) -> Result<Self, CryptoError> {
        let key = codec.reassemble(fragments)?;
        Ok(Self {
            key,
            fragment_count: fragments.len(),
        })
    }

    /// Load a fragment file and reassemble it with the default seed.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let fragments = load_fragments(path)?;
        Self::reassemble(&FragmentCodec::with_default_seed()?, &fragments)
    }

    pub const fn fragment_count(&self) -> usize {
        self.fragment_count
    }
}

impl PublicKeySource for EmbeddedKeyFragments {
    fn public_key(&self) -> &RsaPublicKey {
        &self.key
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hybrid::{public_key_to_pem, test_key_pair};

    fn codec() -> FragmentCodec {
        FragmentCodec::with_default_seed().unwrap()
    }

    fn public_pem() -> String {
        let (_, public) = test_key_pair();
        public_key_to_pem(&public).unwrap()
    }

    #[test]
    fn alphabet_is_a_permutation() {
        let codec = codec();
        let mut sorted = codec.alphabet;
        sorted.sort_unstable();
        let mut base = *BASE_ALPHABET;
        base.sort_unstable();
        assert_eq!(sorted, base);
        assert_ne!(codec.alphabet, *BASE_ALPHABET);
    }

    #[test]
    fn different_seeds_permute_differently() {
        let a = FragmentCodec::new(b"seed-number-one-0000").unwrap();
        let b = FragmentCodec::new(b"seed-number-two-0000").unwrap();
        assert_ne!(a.alphabet, b.alphabet);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let codec = codec();
        for data in [&b""[..], b"A", b"AB", b"ABC", b"-----BEGIN PUBLIC KEY-----\n"] {
            let encoded = codec.encode(data);
            assert_eq!(codec.decode(&encoded).unwrap(), data);
        }
    }

    #[test]
    fn obfuscate_reassemble_roundtrip() {
        let codec = codec();
        let pem = public_pem();
        let fragments = codec.obfuscate(&pem, DEFAULT_FRAGMENT_COUNT).unwrap();
        assert_eq!(fragments.len(), DEFAULT_FRAGMENT_COUNT);

        assert_eq!(codec.reassemble_pem(&fragments).unwrap(), pem);
        let (_, public) = test_key_pair();
        assert_eq!(codec.reassemble(&fragments).unwrap(), public);
    }

    #[test]
    fn fragments_do_not_contain_pem_text() {
        let codec = codec();
        let fragments = codec.obfuscate(&public_pem(), 4).unwrap();
        for fragment in &fragments {
            assert!(!fragment.data.contains("BEGIN PUBLIC"));
        }
    }

    #[test]
    fn reassemble_accepts_any_order() {
        let codec = codec();
        let pem = public_pem();
        let mut fragments = codec.obfuscate(&pem, 5).unwrap();
        fragments.reverse();
        assert_eq!(codec.reassemble_pem(&fragments).unwrap(), pem);
    }

    #[test]
    fn missing_fragment_is_fatal() {
        let codec = codec();
        let mut fragments = codec.obfuscate(&public_pem(), 5).unwrap();
        fragments.pop();
        assert!(matches!(codec.reassemble(&fragments), Err(CryptoError::Format(_))));
    }

    #[test]
    fn duplicate_fragment_is_fatal() {
        let codec = codec();
        let mut fragments = codec.obfuscate(&public_pem(), 5).unwrap();
        fragments[1] = fragments[0].clone();
        assert!(matches!(codec.reassemble(&fragments), Err(CryptoError::Format(_))));
    }

    #[test]
    fn tampered_marker_is_fatal() {
        let codec = codec();
        let mut fragments = codec.obfuscate(&public_pem(), 3).unwrap();
        let mut raw = B64.decode(&fragments[0].marker).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        fragments[0].marker = B64.encode(raw);
        assert!(matches!(
            codec.reassemble(&fragments),
            Err(CryptoError::CryptoIntegrity(_))
        ));
    }

    #[test]
    fn tampered_data_is_fatal() {
        let codec = codec();
        let mut fragments = codec.obfuscate(&public_pem(), 3).unwrap();
        fragments[0].data = "!!!".into();
        assert!(codec.reassemble(&fragments).is_err());
    }

    #[test]
    fn wrong_seed_cannot_reassemble() {
        let fragments = codec().obfuscate(&public_pem(), 3).unwrap();
        let other = FragmentCodec::new(b"another-seed-entirely").unwrap();
        assert!(other.reassemble(&fragments).is_err());
    }

    #[test]
    fn zero_pieces_rejected() {
        assert!(codec().obfuscate(&public_pem(), 0).is_err());
    }

    #[test]
    fn fragment_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragments.json");
        let codec = codec();
        let fragments = codec.obfuscate(&public_pem(), 4).unwrap();

        save_fragments(&path, &fragments).unwrap();
        let embedded = EmbeddedKeyFragments::load(&path).unwrap();

        let (_, public) = test_key_pair();
        assert_eq!(embedded.public_key(), &public);
        assert_eq!(embedded.fragment_count(), 4);
    }
}
