//! Sync Information Element codec.
//!
//! Acknowledgements carry a 4-byte IE `[0x02, 0x1e, status_lo, status_hi]`
//! reporting the receiver's measured drift: bits 0..=10 are the drift
//! magnitude in microseconds, bit 11 the sign (1 = negative), bit 15 the
//! NACK flag, bits 12..=14 reserved zero.

/// Sync IE length in bytes
pub const SYNC_IE_LEN: usize = 4;

/// Sync IE header bytes
pub const SYNC_IE_HEADER: [u8; 2] = [0x02, 0x1e];

/// Maximum reportable drift magnitude in microseconds
pub const MAX_DRIFT_US: i16 = 0x07ff;

const SIGN_FLAG: u16 = 0x0800;
const NACK_FLAG: u16 = 0x8000;

// Drift status values are exchanged in microseconds while the slot
// machine keeps time in radio ticks at ~32.768 kHz: 1 tick = 30.51 us.
// The math stays in 32-bit signed arithmetic to preserve precision
// before truncation to the 12-bit field.

/// Convert radio ticks to microseconds, rounded
pub fn ticks_to_us(ticks: i32) -> i32 {
    div_round(ticks * 3051, 100)
}

/// Convert microseconds to radio ticks, rounded
pub fn us_to_ticks(us: i32) -> i32 {
    div_round(us * 100, 3051)
}

/// Average an accumulated microsecond drift over `count` samples and
/// convert to radio ticks, rounded
pub fn us_avg_to_ticks(acc_us: i32, count: i32) -> i32 {
    div_round(acc_us * 100, 3051 * count)
}

fn div_round(n: i32, d: i32) -> i32 {
    let half = d / 2;
    if n >= 0 {
        (n + half) / d
    } else {
        (n - half) / d
    }
}

/// Encode a drift measurement (in ticks) and NACK flag as a Sync IE.
///
/// Returns the IE bytes and the reported drift in microseconds, saturated
/// at +/-2047 us.
pub fn encode(drift_ticks: i32, nack: bool) -> ([u8; SYNC_IE_LEN], i16) {
    let us = ticks_to_us(drift_ticks);
    let mag = us.unsigned_abs().min(MAX_DRIFT_US as u32) as u16;

    let mut status = mag;
    if us < 0 {
        status |= SIGN_FLAG;
    }
    if nack {
        status |= NACK_FLAG;
    }

    let reported = if us < 0 { -(mag as i16) } else { mag as i16 };

    (
        [
            SYNC_IE_HEADER[0],
            SYNC_IE_HEADER[1],
            status as u8,
            (status >> 8) as u8,
        ],
        reported,
    )
}

/// Decode a Sync IE into (drift in microseconds, NACK flag).
///
/// Returns `None` when the buffer is short or the IE header mismatches.
pub fn decode(buf: &[u8]) -> Option<(i16, bool)> {
    if buf.len() < SYNC_IE_LEN || buf[..2] != SYNC_IE_HEADER {
        return None;
    }

    let status = buf[2] as u16 | ((buf[3] as u16) << 8);

    let mag = (status & MAX_DRIFT_US as u16) as i16;
    let us = if status & SIGN_FLAG != 0 { -mag } else { mag };

    Some((us, status & NACK_FLAG != 0))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        for &ticks in &[0i32, 1, -1, 10, -10, 42, -42, 66, -66] {
            for &nack in &[false, true] {
                let (ie, reported) = encode(ticks, nack);
                let (us, n) = decode(&ie).unwrap();

                assert_eq!(us as i32, ticks_to_us(ticks));
                assert_eq!(us, reported);
                assert_eq!(n, nack);
            }
        }
    }

    #[test]
    fn saturates_at_field_width() {
        // 100 ticks is 3051 us, beyond the 11-bit magnitude
        let (ie, reported) = encode(100, false);
        assert_eq!(reported, MAX_DRIFT_US);
        assert_eq!(decode(&ie).unwrap(), (MAX_DRIFT_US, false));

        let (ie, reported) = encode(-100, false);
        assert_eq!(reported, -MAX_DRIFT_US);
        assert_eq!(decode(&ie).unwrap(), (-MAX_DRIFT_US, false));
    }

    #[test]
    fn wire_format() {
        // +10 ticks reports +305 us
        let (ie, reported) = encode(10, false);
        assert_eq!(reported, 305);
        assert_eq!(ie, [0x02, 0x1e, 0x31, 0x01]);

        // negative drift sets bit 11
        let (ie, _) = encode(-10, false);
        assert_eq!(ie, [0x02, 0x1e, 0x31, 0x09]);

        // NACK sets bit 15
        let (ie, _) = encode(10, true);
        assert_eq!(ie, [0x02, 0x1e, 0x31, 0x81]);
    }

    #[test]
    fn rejects_bad_header() {
        assert_eq!(decode(&[0x02, 0x1f, 0, 0]), None);
        assert_eq!(decode(&[0x02, 0x1e, 0]), None);
        assert_eq!(decode(&[]), None);
    }

    #[test]
    fn tick_conversions_round() {
        assert_eq!(ticks_to_us(10), 305);
        assert_eq!(us_to_ticks(305), 10);
        assert_eq!(us_to_ticks(-305), -10);
        assert_eq!(us_to_ticks(0), 0);
    }

    #[test]
    fn averaged_correction() {
        // one +305 us sample rounds to 10 ticks
        assert_eq!(us_avg_to_ticks(305, 1), 10);
        // the mean of +305 and +200 is 252.5 us, 8 ticks
        assert_eq!(us_avg_to_ticks(505, 2), 8);
        assert_eq!(us_avg_to_ticks(-305, 1), -10);
    }
}
