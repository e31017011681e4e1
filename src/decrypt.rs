//! AES-128 segment decryption.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid IV `{iv}`: {source}")]
    InvalidIv {
        iv: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("ciphertext of {0} bytes has invalid size or padding")]
    Padding(usize),
}

/// Works out the IV for a segment.
///
/// An explicit `IV` attribute wins (hex, with or without a `0x` prefix).
/// Without one, the IV is fifteen zero bytes followed by the low byte of the
/// segment's sequence number.
pub fn derive_iv(explicit: Option<&str>, sequence: u64) -> Result<[u8; IV_LEN], DecryptError> {
    let mut iv = [0u8; IV_LEN];

    match explicit {
        Some(hex_iv) => {
            let digits = hex_iv
                .strip_prefix("0x")
                .or_else(|| hex_iv.strip_prefix("0X"))
                .unwrap_or(hex_iv);
            hex::decode_to_slice(digits, &mut iv).map_err(|source| DecryptError::InvalidIv {
                iv: hex_iv.to_string(),
                source,
            })?;
        }
        None => iv[IV_LEN - 1] = (sequence % 256) as u8,
    }

    Ok(iv)
}

/// Decrypts an AES-128-CBC payload and strips its PKCS#7 padding.
pub fn decrypt(data: &[u8], key: &[u8], iv: &[u8; IV_LEN]) -> Result<Vec<u8>, DecryptError> {
    if key.len() != KEY_LEN {
        return Err(DecryptError::InvalidKeyLength(key.len()));
    }

    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| DecryptError::InvalidKeyLength(key.len()))?;

    let mut buffer = data.to_vec();
    let plain_len = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| DecryptError::Padding(data.len()))?
        .len();
    buffer.truncate(plain_len);

    Ok(buffer)
}

/// Test helper producing what a packager would serve for `plaintext`.
#[cfg(test)]
pub(crate) fn encrypt(plaintext: &[u8], key: &[u8; KEY_LEN], iv: &[u8; IV_LEN]) -> Vec<u8> {
    use cbc::cipher::BlockEncryptMut;

    let padded_len = (plaintext.len() / 16 + 1) * 16;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
        .unwrap()
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .unwrap()
        .to_vec()
}
