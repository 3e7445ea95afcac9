// MAC-key binding: XOR the stored MAC key with (protocol version, active
// metric type), one 32-bit little-endian word each, so peers running
// incompatible versions or metrics cannot authenticate each other. The
// transformation is self-inverse: applying it twice restores the original
// key. Grounded on Etx/src/mcl/sys/crypto.c's CryptoKeyMACModify.

use crate::mac::MAC_KEY_LEN;

/// XOR the first 4 bytes of `key` with `version` and the next 4 bytes with
/// `metric_type`, both little-endian. Applying this twice with the same
/// arguments restores the original key (XOR is its own inverse).
pub fn mix_mac_key(key: &[u8; MAC_KEY_LEN], version: u32, metric_type: u32) -> [u8; MAC_KEY_LEN] {
    let mut out = *key;
    let vb = version.to_le_bytes();
    let mb = metric_type.to_le_bytes();
    for i in 0..4 {
        out[i] ^= vb[i];
        out[4 + i] ^= mb[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_self_inverse() {
        let key = [0x5Au8; 16];
        let mixed = mix_mac_key(&key, 3, 7);
        assert_ne!(mixed, key);
        let restored = mix_mac_key(&mixed, 3, 7);
        assert_eq!(restored, key);
    }

    #[test]
    fn different_metric_types_yield_different_keys() {
        let key = [0u8; 16];
        let a = mix_mac_key(&key, 1, 0 /* HOP */);
        let b = mix_mac_key(&key, 1, 3 /* ETX */);
        assert_ne!(a, b);
    }
}
