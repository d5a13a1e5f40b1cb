pub mod cipher;
pub mod strkey;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("cipher initialization failed")]
    Cipher,

    #[error("nonce generation failed")]
    NonceGeneration,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,

    #[error("encrypted value is too short")]
    InvalidEncryptedValue,

    #[error("decrypted value is not valid utf-8")]
    InvalidUtf8,

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid strkey length {0}")]
    InvalidKeyLength(usize),

    #[error("invalid strkey character")]
    InvalidKeyChar,

    #[error("strkey version byte mismatch")]
    InvalidVersionByte,

    #[error("strkey checksum mismatch")]
    InvalidChecksum,
}
