// HMAC-SHA1, truncated to 16 bytes, over the MAC-covered portion of a frame.
// Grounded on Etx/src/mcl/sys/crypto.c's CryptoMAC (0x36/0x5c pads, 64-byte
// block, A_SHA_DIGEST_LEN truncated to the caller's requested length).

use hmac::{Hmac, Mac};
use sha1::Sha1;

pub const MAC_KEY_LEN: usize = 16;
pub const MAC_LEN: usize = 16;

type HmacSha1 = Hmac<Sha1>;

/// Compute the truncated HMAC-SHA1 MAC over `data` using `key` (16 bytes).
pub fn compute(key: &[u8; MAC_KEY_LEN], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&full[0..MAC_LEN]);
    out
}

/// Constant-time comparison of a received MAC against the computed one.
pub fn verify(key: &[u8; MAC_KEY_LEN], data: &[u8], received: &[u8; MAC_LEN]) -> bool {
    let expected = compute(key, data);
    let mut diff: u8 = 0;
    for i in 0..MAC_LEN {
        diff |= expected[i] ^ received[i];
    }
    diff == 0
}
