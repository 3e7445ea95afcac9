// AES-128-CBC with explicit IV and the MCL padding convention: every padding
// byte (not just the last) carries the pad length, and at least one byte of
// padding is always present even when the plaintext is already block-sized.
// Grounded on Etx/src/mcl/sys/crypto.c's CryptoEncryptPacket/CryptoDecryptPacket.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

pub const AES_KEY_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;

type Enc = cbc::Encryptor<Aes128>;
type Dec = cbc::Decryptor<Aes128>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    NotBlockMultiple,
    InvalidPadding,
}

/// Pad `plaintext` per the MCL convention and return the padded buffer
/// (length always a positive multiple of `BLOCK_LEN`).
pub fn pad(plaintext: &[u8]) -> Vec<u8> {
    let rem = plaintext.len() % BLOCK_LEN;
    let pad_len = if rem == 0 { BLOCK_LEN } else { BLOCK_LEN - rem };
    let mut v = Vec::with_capacity(plaintext.len() + pad_len);
    v.extend_from_slice(plaintext);
    v.resize(v.len() + pad_len, pad_len as u8);
    v
}

/// Validate and strip MCL-convention padding from a decrypted buffer.
pub fn unpad(padded: &[u8]) -> Result<&[u8], CryptoError> {
    if padded.is_empty() || padded.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::NotBlockMultiple);
    }
    let pad_len = *padded.last().unwrap() as usize;
    if pad_len == 0 || pad_len > BLOCK_LEN || pad_len > padded.len() {
        return Err(CryptoError::InvalidPadding);
    }
    let start = padded.len() - pad_len;
    if padded[start..].iter().any(|&b| b as usize != pad_len) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(&padded[..start])
}

/// Encrypt `plaintext` (padded to a block multiple per MCL convention)
/// using AES-128-CBC with the given key and IV. `cbc::Encryptor` maintains
/// feedback state across successive `encrypt_block_mut` calls, so a plain
/// per-block loop is full CBC chaining.
pub fn encrypt(key: &[u8; AES_KEY_LEN], iv: &[u8; BLOCK_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut out = pad(plaintext);
    let mut enc = Enc::new(key.into(), iv.into());
    let blocks = out.len() / BLOCK_LEN;
    for i in 0..blocks {
        let block = <&mut [u8; BLOCK_LEN]>::try_from(&mut out[i * BLOCK_LEN..(i + 1) * BLOCK_LEN]).unwrap();
        enc.encrypt_block_mut(block.into());
    }
    out
}

/// Decrypt an AES-128-CBC ciphertext (must be a positive multiple of
/// `BLOCK_LEN`) and validate/strip MCL-convention padding.
pub fn decrypt(key: &[u8; AES_KEY_LEN], iv: &[u8; BLOCK_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::NotBlockMultiple);
    }
    let mut dec = Dec::new(key.into(), iv.into());
    let mut buf = ciphertext.to_vec();
    let blocks = buf.len() / BLOCK_LEN;
    for i in 0..blocks {
        let block = <&mut [u8; BLOCK_LEN]>::try_from(&mut buf[i * BLOCK_LEN..(i + 1) * BLOCK_LEN]).unwrap();
        dec.decrypt_block_mut(block.into());
    }
    unpad(&buf).map(|s| s.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_exact_block() {
        let key = [0x10u8; 16];
        let iv = [0x20u8; 16];
        let plaintext = [0xAAu8, 0xBB, 0xCC, 0xDD];
        let ct = encrypt(&key, &iv, &plaintext);
        // One block of plaintext+padding: 4 data bytes + 12 pad bytes of value 0x0C.
        assert_eq!(ct.len(), 16);
        let pt = decrypt(&key, &iv, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn block_aligned_plaintext_still_gets_padded() {
        let key = [0x01u8; 16];
        let iv = [0x02u8; 16];
        let plaintext = [0u8; 16];
        let ct = encrypt(&key, &iv, &plaintext);
        assert_eq!(ct.len(), 32);
    }

    #[test]
    fn tampered_padding_is_rejected() {
        let key = [0x03u8; 16];
        let iv = [0x04u8; 16];
        let mut ct = encrypt(&key, &iv, &[1, 2, 3]);
        let last = ct.len() - 1;
        // Flip the last ciphertext byte; with CBC this scrambles the
        // recovered final plaintext block, which should fail pad validation
        // with overwhelming probability.
        ct[last] ^= 0xFF;
        assert!(decrypt(&key, &iv, &ct).is_err());
    }
}
