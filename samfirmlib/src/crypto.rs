use std::{
    cmp,
    convert::TryInto,
    fmt,
    sync::Arc,
};

use aes::{Aes128, Aes256};
use base64::{
    Engine,
    engine::general_purpose::STANDARD,
};
use block_padding::{NoPadding, Padding, Pkcs7};
use cbc::{Decryptor, Encryptor};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cipher::generic_array::{ArrayLength, GenericArray, typenum::{U16, U32, Unsigned}};
use thiserror::Error;

/// Block size for FUS-encrypted protocol data
pub type BlockSize = U32;
/// Key size
pub type KeySize = U32;
/// Block size of the firmware archive cipher
pub type FileBlockSize = U16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Fixed key has incorrect length")]
    IncorrectFixedKeyLength,
    #[error("Flexible key suffix has incorrect length")]
    IncorrectFlexibleKeySuffixLength,
    #[error("Ciphertext is smaller than block size")]
    CiphertextTooSmall,
    #[error("Nonce is not exactly 16 bytes")]
    NonceInvalidSize,
    #[error("Nonce is not valid UTF-8")]
    NonceNotUtf8,
    #[error("Failed to decode base64 data: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),
}

/// The operations the protocol needs from the vendor's proprietary crypto.
/// The protocol client, message builder and key derivation only ever go
/// through this trait.
pub trait FusCrypto: Send + Sync {
    /// Decrypt the opaque `NONCE` header value issued by the server.
    fn decrypt_nonce(&self, nonce: &str) -> Result<String, CryptoError>;

    /// Compute the `signature` field of the Authorization header from a
    /// decrypted nonce.
    fn signature(&self, decrypted_nonce: &str) -> String;

    /// Scramble `input` with `logic_value`. Used for the `<LOGIC_CHECK>`
    /// request fields (keyed by the decrypted nonce) and for deriving the
    /// archive key seed (keyed by the server's logic value).
    fn logic_check(&self, input: &str, logic_value: &str) -> String {
        logic_check(input.as_bytes(), logic_value.as_bytes())
    }
}

impl<T: FusCrypto + ?Sized> FusCrypto for Arc<T> {
    fn decrypt_nonce(&self, nonce: &str) -> Result<String, CryptoError> {
        (**self).decrypt_nonce(nonce)
    }

    fn signature(&self, decrypted_nonce: &str) -> String {
        (**self).signature(decrypted_nonce)
    }

    fn logic_check(&self, input: &str, logic_value: &str) -> String {
        (**self).logic_check(input, logic_value)
    }
}

/// Map every byte of `key` to a byte of `data` using the low nibble as the
/// index. An empty `data` produces an empty string.
pub fn logic_check(data: &[u8], key: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }

    key.iter()
        .map(|c| data[(*c as usize & 0xf) % data.len()] as char)
        .collect()
}

/// Container for holding FUS encryption keys.
#[derive(Clone)]
pub struct FusKeys {
    pub fixed_key: [u8; 32],
    pub flexible_key_suffix: [u8; 16],
}

impl fmt::Debug for FusKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusKeys")
            .field("fixed_key", &String::from_utf8_lossy(&self.fixed_key))
            .field("flexible_key_suffix", &String::from_utf8_lossy(&self.flexible_key_suffix))
            .finish()
    }
}

impl FusKeys {
    /// Load keys from the specified byte slices. The fixed key should be 32
    /// bytes and the flexible key suffix should be 16 bytes.
    pub fn new(
        fixed_key: &[u8],
        flexible_key_suffix: &[u8],
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            fixed_key: fixed_key.try_into()
                .map_err(|_| CryptoError::IncorrectFixedKeyLength)?,
            flexible_key_suffix: flexible_key_suffix.try_into()
                .map_err(|_| CryptoError::IncorrectFlexibleKeySuffixLength)?,
        })
    }

    /// Derive the FUS "flexible key" from the given base. Mod 16 is applied to
    /// each element to form the fixed key index list and the hardcoded suffix
    /// is appended.
    pub fn get_flexible_key(&self, key_base: &[u8]) -> Vec<u8> {
        key_base.iter()
            .map(|x| self.fixed_key[(x % 16) as usize])
            .chain(self.flexible_key_suffix.iter().copied())
            .collect()
    }
}

/// Default [`FusCrypto`] implementation backed by user-supplied FUS keys.
#[derive(Clone, Debug)]
pub struct FusKeyCrypto {
    keys: FusKeys,
}

impl FusKeyCrypto {
    pub fn new(keys: FusKeys) -> Self {
        Self { keys }
    }

    /// Inverse of [`FusCrypto::decrypt_nonce`]. Only needed to fabricate
    /// server responses.
    #[cfg(test)]
    pub fn encrypt_nonce(&self, nonce: &str) -> String {
        STANDARD.encode(FusAes256::new(&self.keys.fixed_key).encrypt(nonce.as_bytes()))
    }
}

impl FusCrypto for FusKeyCrypto {
    fn decrypt_nonce(&self, nonce: &str) -> Result<String, CryptoError> {
        let decoded = STANDARD.decode(nonce.trim())?;
        let plaintext = FusAes256::new(&self.keys.fixed_key).decrypt(&decoded)?;

        // Other functions, such as the one computing <LOGIC_CHECK>, expect at
        // least 16 bytes and the flexible key construction limits it to 16.
        if plaintext.len() != 16 {
            return Err(CryptoError::NonceInvalidSize);
        }

        String::from_utf8(plaintext).map_err(|_| CryptoError::NonceNotUtf8)
    }

    fn signature(&self, decrypted_nonce: &str) -> String {
        let key = self.keys.get_flexible_key(decrypted_nonce.as_bytes());
        let ciphertext = FusAes256::new(&key).encrypt(decrypted_nonce.as_bytes());

        STANDARD.encode(ciphertext)
    }
}

/// Pad byte array to specified block size and optionally truncate to one block.
fn pad<B: ArrayLength<u8>>(mut data: &[u8], truncate_to_block_size: bool) -> Vec<u8> {
    let block_size = B::USIZE;

    if truncate_to_block_size {
        data = &data[..cmp::min(data.len(), block_size)];
    }
    let mut buf = data.to_vec();

    if data.is_empty() || data.len() % block_size != 0 {
        buf.resize((data.len() / block_size + 1) * block_size, 0);

        let last_block_offset = buf.len() - block_size;
        let last_block = &mut buf[last_block_offset..];
        let ga_last_block = GenericArray::<u8, B>::from_mut_slice(last_block);
        Pkcs7::pad(ga_last_block, data.len() % block_size);
    }

    buf
}

/// AES-256-CBC the way FUS expects for protocol data:
/// * The key is PKCS#7 padded to 32 bytes if it is too short or truncated to
///   32 bytes if it is too long. The IV is the first 16 bytes of the key.
/// * The data uses a 32-byte block size. It is PKCS#7 padded to the next
///   32-byte boundary. During decryption, if the last block looks like it has
///   padding, then the padding is truncated.
pub struct FusAes256 {
    dec: Decryptor<Aes256>,
    enc: Encryptor<Aes256>,
}

impl FusAes256 {
    pub fn new(key: &[u8]) -> Self {
        let padded_key = pad::<KeySize>(key, true);
        let iv = &padded_key[..16];

        // Key and IV lengths are fixed by the padding above
        let dec = Decryptor::<Aes256>::new_from_slices(&padded_key, iv).unwrap();
        let enc = Encryptor::<Aes256>::new_from_slices(&padded_key, iv).unwrap();
        Self {
            dec,
            enc,
        }
    }

    pub fn encrypt(self, data: &[u8]) -> Vec<u8> {
        let mut buf = pad::<BlockSize>(data, false);
        let buf_size = buf.len();

        // Cannot fail: the buffer is already block aligned
        self.enc.encrypt_padded_mut::<NoPadding>(&mut buf, buf_size).unwrap();

        buf
    }

    pub fn decrypt(self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = self.dec.decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| CryptoError::CiphertextTooSmall)?;

        if !plaintext.is_empty() {
            let last_block_offset = plaintext.len() - BlockSize::USIZE;
            let last_block = &mut plaintext[last_block_offset..];
            let ga_last_block = GenericArray::<u8, BlockSize>::from_mut_slice(last_block);

            let plaintext_len = match Pkcs7::unpad(ga_last_block) {
                Ok(s) => last_block_offset + s.len(),
                Err(_) => plaintext.len(), // Assume unpadded
            };

            plaintext.truncate(plaintext_len);
        }
        Ok(plaintext)
    }
}

/// 16-byte archive decryption key. Only ever held in memory.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct DecryptionKey([u8; 16]);

impl DecryptionKey {
    /// Key for archives using the logic check scheme (`.enc4`).
    pub fn from_logic_check(crypto: &dyn FusCrypto, version: &str, logic_value: &str) -> Self {
        let seed = crypto.logic_check(version, logic_value);
        Self(md5::compute(seed.as_bytes()).into())
    }

    /// Key for archives using the legacy scheme (`.enc2`).
    pub fn from_legacy(region: &str, model: &str, version: &str) -> Self {
        let seed = format!("{region}:{model}:{version}");
        Self(md5::compute(seed.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for DecryptionKey {
    fn from(key: [u8; 16]) -> Self {
        Self(key)
    }
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecryptionKey(")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

/// Cipher for the firmware archive: plain AES-128-ECB. Every block is
/// independent, so decryption can proceed on any block-aligned chunk. Padding
/// is handled by the caller.
#[derive(Clone)]
pub struct FusFileAes128(Aes128);

impl FusFileAes128 {
    pub fn new(key: &DecryptionKey) -> Self {
        let ga_key = GenericArray::from_slice(key.as_bytes());
        Self(Aes128::new(ga_key))
    }

    /// Decrypt the provided block-aligned ciphertext in-place.
    pub fn decrypt_in_place(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.0.clone().decrypt_padded_mut::<NoPadding>(buf)
            .map_err(|_| CryptoError::CiphertextTooSmall)?;

        Ok(())
    }

    /// Encrypt the provided plaintext with PKCS#7 padding, as the server does.
    #[cfg(test)]
    pub fn encrypt_padded(&self, data: &[u8]) -> Vec<u8> {
        self.0.clone().encrypt_padded_vec_mut::<Pkcs7>(data)
    }
}

/// Remove PKCS#7 padding from the final 16-byte block, returning the number of
/// plaintext bytes in that block.
pub fn unpad_final_block(block: &[u8]) -> Option<usize> {
    if block.len() != FileBlockSize::USIZE {
        return None;
    }
    let ga_block = GenericArray::<u8, FileBlockSize>::from_slice(block);
    Pkcs7::unpad(ga_block).ok().map(|s| s.len())
}
