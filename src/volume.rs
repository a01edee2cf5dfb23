//! Conversion between the front-panel volume and the receiver's wire value.
//!
//! The front panel shows a level in [0, 80] in 0.5 steps. The control
//! protocol uses the inverted scale `800 - level * 10`, and sends values that
//! land on a whole step as two digits (`"40"`) and half steps as three
//! (`"395"`). The conversion is its own inverse under that representation, so
//! the same routine serves both directions.

/// Returned by [`encode`] for input that is not a decimal number
pub const INVALID_LEVEL: i32 = -1;

/// Convert a decimal level (e.g. `"39.5"`) to device units
///
/// The result is truncated toward zero onto a multiple of 5. Unparseable
/// input yields [`INVALID_LEVEL`].
pub fn encode(level: &str) -> i32 {
    let f = match level.trim().parse::<f32>() {
        Ok(f) => f as f64,
        Err(e) => {
            tracing::warn!("could not parse volume level {:?}: {}", level, e);
            return INVALID_LEVEL;
        }
    };

    let i = (800.0 - f * 10.0) as i32;
    i - (i % 5)
}

/// Convert a device value (e.g. `"395"` or `"40"`) to a front-panel level
pub fn decode(device: &str) -> String {
    // 415 -> 41.5
    let normalized = if device.len() == 3 && device.is_char_boundary(2) {
        format!("{}.{}", &device[..2], &device[2..])
    } else {
        device.to_string()
    };

    let level = encode(&normalized) as f32 / 10.0;
    format!("{:.1}", level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reference_values() {
        let cases = [
            ("410", "39.0"),
            ("39", "41.0"),
            ("0", "80.0"),
            ("80.0", "0.0"),
            ("95.0", "-15.0"),
            ("", "-0.1"),
        ];

        for (input, want) in cases {
            assert_eq!(decode(input), want, "decode({:?})", input);
        }
    }

    #[test]
    fn encode_reference_values() {
        let cases = [("41.0", 390), ("41.5", 385), ("40", 400), ("", INVALID_LEVEL)];

        for (input, want) in cases {
            assert_eq!(encode(input), want, "encode({:?})", input);
        }
    }

    #[test]
    fn truncates_toward_zero() {
        // 800 - 41.3 * 10 = 387 -> 385
        assert_eq!(encode("41.3"), 385);
        // 800 - 81.3 * 10 = -13 -> -10, not -15
        assert_eq!(encode("81.3"), -10);
    }

    #[test]
    fn round_trips_every_half_step() {
        for step in 0..=160 {
            let level = format!("{:.1}", step as f32 / 2.0);
            let units = encode(&level);
            assert_eq!(units % 5, 0);
            assert!((0..=800).contains(&units), "{} -> {}", level, units);

            // The receiver echoes whole steps as two digits, half steps as three.
            let wire = if units % 10 == 0 {
                format!("{:02}", units / 10)
            } else {
                format!("{:03}", units)
            };
            assert_eq!(decode(&wire), level, "wire value {}", wire);
        }
    }

    #[test]
    fn encode_is_non_increasing() {
        let mut previous = i32::MAX;
        for step in 0..=160 {
            let units = encode(&format!("{:.1}", step as f32 / 2.0));
            assert!(units <= previous);
            previous = units;
        }
    }

    #[test]
    fn three_digits_imply_a_decimal_point() {
        assert_eq!(decode("505"), "29.5");
        assert_eq!(decode("50"), "30.0");
        assert_ne!(decode("400"), decode("40"));
    }
}
