//! Max Resp Code decoding (RFC 2236 §2.2, RFC 3376 §4.1.1).
//!
//! IGMPv2 carries the maximum response time as a plain decisecond count.
//! IGMPv3 keeps that interpretation below 128 and switches to a small
//! floating-point format above it:
//!
//! ```text
//!  0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+
//! |1| exp | mant  |
//! +-+-+-+-+-+-+-+-+
//! Max Resp Time = (mant | 0x10) << (exp + 3)
//! ```

use std::time::Duration;

use super::IgmpVersion;

const FLOAT_FLAG: u8 = 0x80;
const EXP_MASK: u8 = 0x70;
const EXP_SHIFT: u8 = 4;
const MANT_MASK: u8 = 0x0F;

/// Largest value expressible by the IGMPv3 encoding, in deciseconds (0xFF).
pub const MAX_V3_DECISECONDS: u32 = 31 << 10;

/// Decode a Max Resp Code into deciseconds.
pub fn decode_deciseconds(code: u8, version: IgmpVersion) -> u32 {
    match version {
        IgmpVersion::V2 => u32::from(code),
        IgmpVersion::V3 if code < FLOAT_FLAG => u32::from(code),
        IgmpVersion::V3 => {
            let exp = (code & EXP_MASK) >> EXP_SHIFT;
            let mant = code & MANT_MASK;
            u32::from(mant | 0x10) << (exp + 3)
        }
    }
}

/// Decode a Max Resp Code into the maximum response time.
pub fn max_response_time(code: u8, version: IgmpVersion) -> Duration {
    Duration::from_millis(u64::from(decode_deciseconds(code, version)) * 100)
}

/// Maximum response time in seconds, as used by the timing checks.
pub fn max_response_secs(code: u8, version: IgmpVersion) -> f64 {
    f64::from(decode_deciseconds(code, version)) / 10.0
}

/// Encode a decisecond count as an IGMPv3 Max Resp Code.
///
/// Values that cannot be represented exactly are rounded down so the
/// advertised time never exceeds the requested one; values above
/// [`MAX_V3_DECISECONDS`] saturate at `0xFF`.
pub fn encode_v3(deciseconds: u32) -> u8 {
    if deciseconds < u32::from(FLOAT_FLAG) {
        return deciseconds as u8;
    }
    if deciseconds >= MAX_V3_DECISECONDS {
        return 0xFF;
    }
    for exp in 0u8..8 {
        let mant = deciseconds >> (exp + 3);
        if mant < 0x20 {
            return FLOAT_FLAG | (exp << EXP_SHIFT) | ((mant as u8) & MANT_MASK);
        }
    }
    0xFF
}

/// Encode a decisecond count for the given version. IGMPv2 saturates at 255.
pub fn encode(deciseconds: u32, version: IgmpVersion) -> u8 {
    match version {
        IgmpVersion::V2 => deciseconds.min(u32::from(u8::MAX)) as u8,
        IgmpVersion::V3 => encode_v3(deciseconds),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_is_plain_deciseconds() {
        assert_eq!(max_response_secs(100, IgmpVersion::V2), 10.0);
        assert_eq!(max_response_secs(0, IgmpVersion::V2), 0.0);
        assert_eq!(max_response_secs(255, IgmpVersion::V2), 25.5);
        // No floating-point interpretation in v2, even with the top bit set.
        assert_eq!(decode_deciseconds(0x80, IgmpVersion::V2), 128);
    }

    #[test]
    fn v3_below_128_matches_v2() {
        assert_eq!(max_response_secs(50, IgmpVersion::V3), 5.0);
        for code in 0u8..128 {
            assert_eq!(
                decode_deciseconds(code, IgmpVersion::V3),
                decode_deciseconds(code, IgmpVersion::V2)
            );
        }
    }

    #[test]
    fn v3_float_rfc3376_values() {
        // exp=0, mant=0: 0x10 << 3 = 128 ds
        assert_eq!(decode_deciseconds(0x80, IgmpVersion::V3), 128);
        assert_eq!(max_response_time(0x80, IgmpVersion::V3), Duration::from_millis(12_800));
        // exp=7, mant=15: 0x1F << 10 = 31744 ds
        assert_eq!(decode_deciseconds(0xFF, IgmpVersion::V3), MAX_V3_DECISECONDS);
        assert_eq!(max_response_secs(0xFF, IgmpVersion::V3), 3174.4);
        // exp=1, mant=3: 0x13 << 4 = 304 ds
        assert_eq!(decode_deciseconds(0x93, IgmpVersion::V3), 304);
    }

    #[test]
    fn v3_exponent_uses_all_three_bits() {
        // Every exponent value must scale the result; a 0/1 exponent would
        // make exp=2..7 collapse onto exp=1.
        for exp in 0u8..8 {
            let code = 0x80 | (exp << 4) | 0x05;
            let expected = (0x15u32) << (exp + 3);
            assert_eq!(decode_deciseconds(code, IgmpVersion::V3), expected, "code {code:#x}");
        }
        assert_eq!(decode_deciseconds(0xD0, IgmpVersion::V3), 16 << 8);
    }

    #[test]
    fn v3_decode_is_monotonic_over_the_byte_range() {
        let mut prev = 0;
        for code in 0u8..=255 {
            let ds = decode_deciseconds(code, IgmpVersion::V3);
            assert!(ds >= prev, "code {code:#x} decreased: {ds} < {prev}");
            prev = ds;
        }
    }

    #[test]
    fn encode_v3_round_trips_representable_values() {
        for code in 0u8..=255 {
            let ds = decode_deciseconds(code, IgmpVersion::V3);
            assert_eq!(encode_v3(ds), code);
        }
    }

    #[test]
    fn encode_v3_rounds_down() {
        // 300 s = 3000 ds: exp=4 gives mant 3000>>7 = 23 -> 23<<7 = 2944 ds
        let code = encode_v3(3000);
        assert_eq!(code, 0xC7);
        assert_eq!(decode_deciseconds(code, IgmpVersion::V3), 2944);
        assert_eq!(encode_v3(40_000), 0xFF);
        assert_eq!(encode_v3(10), 10);
    }

    #[test]
    fn encode_v2_saturates() {
        assert_eq!(encode(3000, IgmpVersion::V2), 255);
        assert_eq!(encode(100, IgmpVersion::V2), 100);
    }
}
