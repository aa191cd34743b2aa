// Geodesy module - unit conversions and compressed GPS decoding
//
// The avionics link reports position in a compressed form where the integer
// part packs degrees and minutes (DDDMM) and the first two fractional digits
// are whole seconds, the remainder fractional seconds:
//
//   -8234.5678  ->  -(82° 34' 56.78")

use crate::constants::MTOF;

/// Converts metres to feet. Returns None for non-finite input.
pub fn metres_to_feet(metres: f64) -> Option<f64> {
    if !metres.is_finite() {
        return None;
    }
    Some(metres * MTOF)
}

/// Converts feet to metres. Returns None for non-finite input.
pub fn feet_to_metres(feet: f64) -> Option<f64> {
    if !feet.is_finite() {
        return None;
    }
    Some(feet / MTOF)
}

/// Decodes a compressed GPS value into signed decimal degrees.
///
/// `0` and any non-finite input decode to exactly `0.0`, which callers must
/// read as "no fix" rather than a coordinate on the equator or prime meridian.
///
/// # Example
/// ```
/// use gcs_telemetry::geodesy::gps_to_decimal;
/// let lat = gps_to_decimal(-8234.5678);
/// assert!((lat + (82.0 + 34.0 / 60.0 + 56.78 / 3600.0)).abs() < 1e-9);
/// ```
pub fn gps_to_decimal(gps: f64) -> f64 {
    if !gps.is_finite() || gps == 0.0 {
        return 0.0;
    }
    decode_text(&gps.to_string()).unwrap_or(0.0)
}

/// Decodes the textual form of a compressed GPS value.
///
/// Working on the digits rather than the float keeps the seconds exact; the
/// sender formats the fractional part as `SSsss...`.
pub fn decode_text(text: &str) -> Option<f64> {
    let text = text.trim();
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let (int_part, dec_part) = match body.split_once('.') {
        Some((i, d)) => (i, Some(d)),
        None => (body, None),
    };
    if int_part.is_empty() && dec_part.map_or(true, str::is_empty) {
        return None;
    }

    let packed: u64 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let degrees = (packed / 100) as f64;
    let minutes = (packed % 100) as f64;

    let seconds = match dec_part {
        Some(d) if !d.is_empty() => {
            if !d.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let (whole, frac) = d.split_at(d.len().min(2));
            let secs: f64 = format!("{}.{}", whole, if frac.is_empty() { "0" } else { frac })
                .parse()
                .ok()?;
            // A single fractional digit carries tens of seconds ("5" == "50")
            if whole.len() == 1 { secs * 10.0 } else { secs }
        }
        _ => 0.0,
    };

    let magnitude = degrees + minutes / 60.0 + seconds / 3600.0;
    Some(if negative { -magnitude } else { magnitude })
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    #[test]
    fn test_gps_negative_preserves_sign() {
        let decoded = gps_to_decimal(-8234.5678);
        let expected = -(82.0 + 34.0 / 60.0 + 56.78 / 3600.0);
        assert!((decoded - expected).abs() < EPSILON, "got {}", decoded);
    }

    #[test]
    fn test_gps_positive() {
        let decoded = gps_to_decimal(14500.623);
        let expected = 145.0 + 0.0 / 60.0 + 62.3 / 3600.0;
        assert!((decoded - expected).abs() < EPSILON, "got {}", decoded);
    }

    #[test]
    fn test_gps_zero_is_no_fix() {
        assert_eq!(gps_to_decimal(0.0), 0.0);
        assert_eq!(gps_to_decimal(-0.0), 0.0);
        assert_eq!(gps_to_decimal(f64::NAN), 0.0);
        assert_eq!(gps_to_decimal(f64::INFINITY), 0.0);
    }

    #[test]
    fn test_gps_integer_only() {
        let decoded = gps_to_decimal(3330.0);
        assert!((decoded - 33.5).abs() < EPSILON);
    }

    #[test]
    fn test_gps_fraction_below_one_degree_keeps_sign() {
        // "-0.5" must stay negative even though the integer part is zero
        let decoded = decode_text("-0.5").unwrap();
        assert!(decoded < 0.0);
        assert!((decoded + 50.0 / 3600.0).abs() < EPSILON);
    }

    #[test]
    fn test_decode_text_rejects_garbage() {
        assert_eq!(decode_text("abc"), None);
        assert_eq!(decode_text(""), None);
        assert_eq!(decode_text("12.3x"), None);
    }

    #[test]
    fn test_unit_conversion() {
        assert!((metres_to_feet(1000.0).unwrap() - 3280.84).abs() < 1e-9);
        assert!((feet_to_metres(3280.84).unwrap() - 1000.0).abs() < 1e-9);
        assert_eq!(metres_to_feet(f64::NAN), None);
        assert_eq!(feet_to_metres(f64::INFINITY), None);
    }
}
