//! Bech32 address helpers.
//!
//! Participant accounts, validator operators and consensus keys share the
//! same 20-byte payload under different human-readable prefixes. Only the
//! original bech32 checksum (BIP-173) is produced on this chain.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bech32::{Bech32, Hrp};
use sha2::{Digest, Sha256};

use crate::constants::{VALCONS_PREFIX, VALOPER_PREFIX};
use crate::error::{CoreError, Result};

/// Decode a bech32 address into its lowercase prefix and payload bytes.
pub fn decode(address: &str) -> Result<(String, Vec<u8>)> {
    let (hrp, payload) =
        bech32::decode(address).map_err(|_| CoreError::InvalidAddress(address.to_string()))?;
    Ok((hrp.to_lowercase(), payload))
}

/// Encode payload bytes under a prefix.
pub fn encode(prefix: &str, payload: &[u8]) -> Result<String> {
    let invalid = || CoreError::InvalidAddress(prefix.to_string());
    let hrp = Hrp::parse(prefix).map_err(|_| invalid())?;
    bech32::encode::<Bech32>(hrp, payload).map_err(|_| invalid())
}

/// Re-encode an address under another prefix, keeping its payload.
pub fn convert_prefix(address: &str, new_prefix: &str) -> Result<String> {
    let (_, payload) = decode(address)?;
    encode(new_prefix, &payload)
}

/// Validator operator address of a participant account.
pub fn to_valoper(address: &str) -> Result<String> {
    convert_prefix(address, VALOPER_PREFIX)
}

/// Consensus address of a base64 ed25519 public key: `sha256(pubkey)[..20]`.
pub fn pubkey_to_valcons(pubkey_b64: &str) -> Result<String> {
    let pubkey = STANDARD
        .decode(pubkey_b64.trim())
        .map_err(|_| CoreError::InvalidPublicKey)?;
    let digest = Sha256::digest(&pubkey);
    encode(VALCONS_PREFIX, &digest[..20])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vector_decodes() {
        let (hrp, payload) = decode("A12UEL5L").unwrap();
        assert_eq!(hrp, "a");
        assert!(payload.is_empty());
    }

    #[test]
    fn test_rejects_bad_checksum_and_mixed_case() {
        assert!(decode("a12uel5m").is_err());
        assert!(decode("A12uEL5L").is_err());
        assert!(decode("pzry9x0s0muk").is_err());
        assert_eq!(
            encode("", &[0u8; 20]),
            Err(CoreError::InvalidAddress(String::new()))
        );
    }

    #[test]
    fn test_prefix_conversion_keeps_payload() {
        let account = encode("gonka", &[7u8; 20]).unwrap();
        let valoper = to_valoper(&account).unwrap();

        assert!(account.starts_with("gonka1"));
        assert!(valoper.starts_with("gonkavaloper1"));
        assert_eq!(decode(&valoper).unwrap().1, vec![7u8; 20]);
        assert_eq!(convert_prefix(&valoper, "gonka").unwrap(), account);
    }

    #[test]
    fn test_pubkey_to_valcons() {
        let pubkey = STANDARD.encode([1u8; 32]);
        let valcons = pubkey_to_valcons(&pubkey).unwrap();
        assert!(valcons.starts_with("gonkavalcons1"));

        let (hrp, payload) = decode(&valcons).unwrap();
        assert_eq!(hrp, VALCONS_PREFIX);
        assert_eq!(payload, Sha256::digest([1u8; 32])[..20].to_vec());

        assert_eq!(
            pubkey_to_valcons("not base64!"),
            Err(CoreError::InvalidPublicKey)
        );
    }
}
