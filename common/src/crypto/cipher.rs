use chacha20poly1305::{aead::Aead, AeadCore, KeyInit, XChaCha20Poly1305, XNonce};
use zeroize::Zeroizing;

use super::CryptoError;

pub const CIPHER_KEY_SIZE: usize = 32;

// Encrypts custodial secret seeds at rest. Ciphertext layout is the
// plaintext nonce followed by the sealed bytes; a fresh random nonce is
// generated for every value.
pub struct SeedCipher {
    cipher: XChaCha20Poly1305,
}

impl SeedCipher {
    pub const NONCE_SIZE: usize = 24;

    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            cipher: XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Cipher)?,
        })
    }

    // Key material is handed around as hex in configuration
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoError> {
        let key = Zeroizing::new(hex::decode(key_hex)?);
        if key.len() != CIPHER_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        Self::new(&key)
    }

    // Seal a seed; the result is hex so it can live in a TEXT column
    pub fn encrypt_seed(&self, seed: &str) -> Result<String, CryptoError> {
        let nonce = XChaCha20Poly1305::generate_nonce().map_err(|_| CryptoError::NonceGeneration)?;

        let sealed = self
            .cipher
            .encrypt(&nonce, seed.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let nonce_bytes: [u8; Self::NONCE_SIZE] = nonce.into();
        let mut encrypted = Vec::with_capacity(Self::NONCE_SIZE + sealed.len());
        encrypted.extend_from_slice(&nonce_bytes);
        encrypted.extend_from_slice(&sealed);

        Ok(hex::encode(encrypted))
    }

    // Open a value produced by encrypt_seed. The plaintext is wiped when
    // the returned guard drops.
    pub fn decrypt_seed(&self, encrypted_hex: &str) -> Result<Zeroizing<String>, CryptoError> {
        let encrypted = Zeroizing::new(hex::decode(encrypted_hex)?);
        if encrypted.len() <= Self::NONCE_SIZE {
            return Err(CryptoError::InvalidEncryptedValue);
        }

        let nonce = XNonce::try_from(&encrypted[0..Self::NONCE_SIZE])
            .map_err(|_| CryptoError::InvalidEncryptedValue)?;

        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(&nonce, &encrypted[Self::NONCE_SIZE..])
                .map_err(|_| CryptoError::Decrypt)?,
        );

        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SeedCipher {
        SeedCipher::new(&[7u8; CIPHER_KEY_SIZE]).unwrap()
    }

    #[test]
    fn round_trip() {
        let cipher = test_cipher();
        let seed = "SCZANGBA5YHTNYVVV4C3U252E2B6P6F5T3U6MM63WBSBZATAQI3EBTQ4";
        let sealed = cipher.encrypt_seed(seed).unwrap();
        assert_ne!(sealed, seed);
        assert_eq!(cipher.decrypt_seed(&sealed).unwrap().as_str(), seed);
    }

    #[test]
    fn nonce_is_unique_per_value() {
        let cipher = test_cipher();
        let a = cipher.encrypt_seed("seed").unwrap();
        let b = cipher.encrypt_seed("seed").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = test_cipher().encrypt_seed("seed").unwrap();
        let other = SeedCipher::new(&[9u8; CIPHER_KEY_SIZE]).unwrap();
        assert!(other.decrypt_seed(&sealed).is_err());
    }

    #[test]
    fn truncated_value_rejected() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.decrypt_seed("00ff"),
            Err(CryptoError::InvalidEncryptedValue)
        ));
    }

    #[test]
    fn key_length_enforced() {
        assert!(matches!(
            SeedCipher::from_hex("00ff00"),
            Err(CryptoError::InvalidKeyLength(3))
        ));
    }
}
