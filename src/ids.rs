//! Conversion between the public `BV…` video id and the numeric `av` id used
//! by the comment API (`oid`).
//!
//! The scheme is the site's published obfuscation: swap two character pairs,
//! read the tail as base-58 over a fixed alphabet, then mask and XOR with a
//! fixed constant. Invalid inputs never fail hard; they produce `0` / an
//! empty string and a warning so a single bad record cannot abort a harvest.

use tracing::warn;

const XOR_CODE: i64 = 23442827791579;
const MASK_CODE: i64 = 2251799813685247;
const ALPHABET: &[u8] = b"FcwAPNKTMug3GV5Lj7EJnHpWsx4tb8haYeviqBz6rkCy12mUSDQX9RdoZf";

const BVID_LEN: usize = 12;

/// Converts a `BV…` id to the numeric av id. Returns `0` for malformed input.
pub fn bvid_to_avid(bvid: &str) -> i64 {
    if bvid.len() != BVID_LEN || !bvid.starts_with("BV1") {
        warn!(bvid, "invalid bvid, cannot convert to avid");
        return 0;
    }

    let mut chars = bvid.as_bytes().to_vec();
    chars.swap(3, 9);
    chars.swap(4, 7);

    let mut value: i64 = 0;
    for &c in &chars[3..] {
        let Some(digit) = ALPHABET.iter().position(|&a| a == c) else {
            warn!(bvid, "bvid contains a character outside the id alphabet");
            return 0;
        };
        value = value * 58 + digit as i64;
    }

    (value & MASK_CODE) ^ XOR_CODE
}

/// Converts a numeric av id back to its `BV…` form. Returns an empty string
/// for non-positive input.
pub fn avid_to_bvid(avid: i64) -> String {
    if avid <= 0 {
        warn!(avid, "invalid avid, cannot convert to bvid");
        return String::new();
    }

    let mut out = *b"BV1000000000";
    let mut temp = (avid | (MASK_CODE + 1)) ^ XOR_CODE;
    let mut idx = BVID_LEN - 1;
    while temp > 0 {
        out[idx] = ALPHABET[(temp % 58) as usize];
        temp /= 58;
        idx -= 1;
    }
    out.swap(3, 9);
    out.swap(4, 7);

    String::from_utf8(out.to_vec()).expect("bvid alphabet is ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The second video ever uploaded is the de-facto reference pair for this
    /// codec.
    #[test]
    fn decodes_known_bvid() {
        assert_eq!(bvid_to_avid("BV1xx411c7mD"), 2);
    }

    #[test]
    fn encodes_known_avid() {
        assert_eq!(avid_to_bvid(2), "BV1xx411c7mD");
    }

    /// Both directions must be inverses for every valid id.
    #[test]
    fn round_trips_in_both_directions() {
        for avid in [2i64, 170001, 1176840, 99999999, 1_000_000_000_000] {
            let bvid = avid_to_bvid(avid);
            assert_eq!(bvid.len(), BVID_LEN);
            assert!(bvid.starts_with("BV1"));
            assert_eq!(bvid_to_avid(&bvid), avid, "avid {avid} did not round trip");
        }

        let bvid = "BV1xx411c7mD";
        assert_eq!(avid_to_bvid(bvid_to_avid(bvid)), bvid);
    }

    /// Malformed ids degrade to zero / empty rather than propagating errors.
    #[test]
    fn rejects_malformed_input() {
        assert_eq!(bvid_to_avid(""), 0);
        assert_eq!(bvid_to_avid("BV1short"), 0);
        assert_eq!(bvid_to_avid("AV1xx411c7mD"), 0);
        assert_eq!(bvid_to_avid("BV1xx411c7m0"), 0, "0 is not in the alphabet");
        assert_eq!(avid_to_bvid(0), "");
        assert_eq!(avid_to_bvid(-5), "");
    }
}
