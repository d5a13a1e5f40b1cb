use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use kale_common::crypto::strkey;

use crate::{ChainError, NewWallet};

// Custodial keypairs are plain ed25519; the strkey forms are what the
// rest of the system passes around.

pub fn generate() -> NewWallet {
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(seed.as_mut());
    let signing = SigningKey::from_bytes(&seed);
    NewWallet {
        public: strkey::encode_public(&signing.verifying_key().to_bytes()),
        secret: strkey::encode_seed(&seed),
    }
}

pub fn signing_key_from_seed(secret: &str) -> Result<SigningKey, ChainError> {
    let seed = Zeroizing::new(strkey::decode_seed(secret)?);
    Ok(SigningKey::from_bytes(&seed))
}

// The public strkey a given seed controls
pub fn public_of_secret(secret: &str) -> Result<String, ChainError> {
    let signing = signing_key_from_seed(secret)?;
    Ok(strkey::encode_public(&signing.verifying_key().to_bytes()))
}

// Raw public key bytes as hex, the form the nonce-search subprocess takes
pub fn public_hex_of_secret(secret: &str) -> Result<String, ChainError> {
    let signing = signing_key_from_seed(secret)?;
    Ok(hex::encode(signing.verifying_key().to_bytes()))
}

pub fn sign_digest(secret: &str, digest: &[u8; 32]) -> Result<String, ChainError> {
    let signing = signing_key_from_seed(secret)?;
    Ok(hex::encode(signing.sign(digest).to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_wallets_are_well_formed() {
        let wallet = generate();
        assert_eq!(wallet.public.len(), 56);
        assert!(wallet.public.starts_with('G'));
        assert_eq!(wallet.secret.len(), 56);
        assert!(wallet.secret.starts_with('S'));
    }

    #[test]
    fn secret_derives_its_public() {
        let wallet = generate();
        assert_eq!(public_of_secret(&wallet.secret).unwrap(), wallet.public);
    }

    #[test]
    fn generation_is_not_deterministic() {
        assert_ne!(generate().public, generate().public);
    }

    #[test]
    fn public_hex_is_32_bytes() {
        let wallet = generate();
        let raw = public_hex_of_secret(&wallet.secret).unwrap();
        assert_eq!(raw.len(), 64);
        assert!(hex::decode(&raw).is_ok());
    }

    #[test]
    fn bad_seed_is_rejected() {
        assert!(signing_key_from_seed("not-a-seed").is_err());
        let wallet = generate();
        // public keys are not seeds
        assert!(signing_key_from_seed(&wallet.public).is_err());
    }
}
