//! Key to slot hashing.
//!
//! Keys hash onto a fixed slot space with CRC16 (XMODEM), the same
//! scheme Redis Cluster uses. A `{tag}` inside the key restricts
//! hashing to the tag so related keys can be pinned to one slot.

use crate::types::Slot;

/// Number of slots in a full-size ring.
pub const SLOTS: u32 = 16384;

/// CRC16-XMODEM (poly 0x1021, init 0).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Slot for `key` in a ring of `SLOTS` slots.
pub fn key_slot(key: &[u8]) -> Slot {
    slot_in(key, SLOTS)
}

/// Slot for `key` in a ring of `size` slots.
pub fn slot_in(key: &[u8], size: u32) -> Slot {
    u32::from(crc16(hash_tag(key))) % size.max(1)
}

fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn known_key_slots() {
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
    }

    #[test]
    fn hash_tags_pin_keys_together() {
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"{user1000}.followers"));
        assert_eq!(key_slot(b"{user1000}.following"), key_slot(b"user1000"));
    }

    #[test]
    fn empty_tag_hashes_whole_key() {
        assert_eq!(key_slot(b"foo{}bar"), u32::from(crc16(b"foo{}bar")) % SLOTS);
    }

    #[test]
    fn small_rings() {
        assert!(slot_in(b"orders", 100) < 100);
        assert_eq!(slot_in(b"anything", 1), 0);
    }
}
