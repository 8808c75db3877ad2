//! Address encoding and validation for the two chain families.
//!
//! Bitcoin-family addresses are 25-byte base58check payloads: a leading
//! version byte, a 20-byte pubkey hash, and a double-SHA256 checksum.
//! Skycoin-family addresses put the version byte after the hash and checksum
//! with a single SHA256. Validation is pure; no node roundtrip.

use crate::base58;
use sha2::{Digest, Sha256};

const BTC_VERSION_P2PKH: u8 = 0x00;
const BTC_VERSION_P2SH: u8 = 0x05;
const SKY_VERSION: u8 = 0x00;

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn pubkey_hash(pubkey: &[u8]) -> [u8; 20] {
    let digest = sha256(pubkey);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest[..20]);
    hash
}

pub fn bitcoin_address(pubkey: &[u8]) -> String {
    let mut payload = Vec::with_capacity(25);
    payload.push(BTC_VERSION_P2PKH);
    payload.extend_from_slice(&pubkey_hash(pubkey));
    let checksum = sha256(&sha256(&payload));
    payload.extend_from_slice(&checksum[..4]);
    base58::encode(&payload)
}

pub fn skycoin_address(pubkey: &[u8]) -> String {
    let mut payload = Vec::with_capacity(25);
    payload.extend_from_slice(&pubkey_hash(pubkey));
    payload.push(SKY_VERSION);
    let checksum = sha256(&payload);
    payload.extend_from_slice(&checksum[..4]);
    base58::encode(&payload)
}

pub fn validate_bitcoin(addr: &str) -> bool {
    let Some(bytes) = base58::decode(addr) else {
        return false;
    };
    if bytes.len() != 25 {
        return false;
    }
    if bytes[0] != BTC_VERSION_P2PKH && bytes[0] != BTC_VERSION_P2SH {
        return false;
    }
    let checksum = sha256(&sha256(&bytes[..21]));
    bytes[21..] == checksum[..4]
}

pub fn validate_skycoin(addr: &str) -> bool {
    let Some(bytes) = base58::decode(addr) else {
        return false;
    };
    if bytes.len() != 25 {
        return false;
    }
    if bytes[20] != SKY_VERSION {
        return false;
    }
    let checksum = sha256(&bytes[..21]);
    bytes[21..] == checksum[..4]
}
