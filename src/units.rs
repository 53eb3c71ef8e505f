//! ADC count ↔ millivolt conversion.

use crate::capabilities::Range;

/// `mv = raw * full_scale / max_adc`, truncated toward zero.
pub fn adc_to_mv(raw: i16, range: Range, max_adc: i16) -> i32 {
    if max_adc == 0 {
        return 0;
    }
    let mv = i64::from(raw) * i64::from(range.full_scale_mv()) / i64::from(max_adc);
    mv as i32
}

/// Inverse of [`adc_to_mv`], saturating at the ADC limits.
pub fn mv_to_adc(mv: i32, range: Range, max_adc: i16) -> i16 {
    let full_scale = i64::from(range.full_scale_mv());
    let adc = i64::from(mv) * i64::from(max_adc) / full_scale;
    adc.clamp(-i64::from(max_adc), i64::from(max_adc)) as i16
}

/// Size of one ADC step in whole millivolts, rounded up.
pub fn lsb_mv(range: Range, max_adc: i16) -> i32 {
    let full_scale = range.full_scale_mv();
    let max_adc = i32::from(max_adc.max(1));
    (full_scale + max_adc - 1) / max_adc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scale_maps_to_range() {
        assert_eq!(adc_to_mv(32_512, Range::R5V, 32_512), 5_000);
        assert_eq!(adc_to_mv(-32_512, Range::R5V, 32_512), -5_000);
        assert_eq!(adc_to_mv(0, Range::R5V, 32_512), 0);
        assert_eq!(mv_to_adc(2_500, Range::R5V, 32_512), 16_256);
    }

    #[test]
    fn test_mv_to_adc_saturates() {
        assert_eq!(mv_to_adc(9_000, Range::R5V, 32_767), 32_767);
        assert_eq!(mv_to_adc(-9_000, Range::R5V, 32_767), -32_767);
    }

    #[test]
    fn test_round_trip_within_one_lsb() {
        for (range, max_adc) in [
            (Range::R10mV, 32_512),
            (Range::R5V, 32_512),
            (Range::R20V, 32_767),
            (Range::R50V, 32_767),
            (Range::R20V, 127),
        ] {
            let max_mv = range.full_scale_mv();
            let tolerance = lsb_mv(range, max_adc);
            for v in [-max_mv, -max_mv / 2, 0, max_mv / 2, max_mv - 1] {
                let back = adc_to_mv(mv_to_adc(v, range, max_adc), range, max_adc);
                assert!(
                    (back - v).abs() <= tolerance,
                    "{range} max_adc={max_adc}: {v} -> {back}"
                );
            }
        }
    }
}
