//! Special functions missing from `std`.

use std::f64::consts::PI;

/// Error function.
///
/// Power series below 3, continued fraction for the complement above.
pub fn erf(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let ax = x.abs();
    let value = if ax < 3.0 {
        let mut sum: f64 = 0.0;
        let mut term = ax;
        let x2 = ax * ax;
        let mut n = 0.0;
        while term.abs() > 1e-17 * sum.abs().max(1e-300) || n < 2.0 {
            sum += term / (2.0 * n + 1.0);
            n += 1.0;
            term *= -x2 / n;
            if n > 200.0 {
                break;
            }
        }
        sum * 2.0 / PI.sqrt()
    } else {
        1.0 - erfc_cf(ax)
    };
    value.copysign(x)
}

// erfc(x) for x >= 3 by backward evaluation of the Laplace continued fraction
fn erfc_cf(x: f64) -> f64 {
    let mut f = x;
    for k in (1..=60).rev() {
        f = x + (k as f64 / 2.0) / f;
    }
    (-x * x).exp() / (PI.sqrt() * f)
}

/// Inverse error function on `(-1, 1)`; infinities at the ends.
///
/// A rational first guess refined by Newton steps on [`erf`].
pub fn erfinv(y: f64) -> f64 {
    if y.is_nan() || y.abs() > 1.0 {
        return f64::NAN;
    }
    if y == 1.0 {
        return f64::INFINITY;
    }
    if y == -1.0 {
        return f64::NEG_INFINITY;
    }
    let w = -((1.0 - y) * (1.0 + y)).ln();
    let mut x = if w < 5.0 {
        let w = w - 2.5;
        let mut p = 2.810_226_36e-08;
        p = 3.432_739_39e-07 + p * w;
        p = -3.523_387_7e-06 + p * w;
        p = -4.391_506_54e-06 + p * w;
        p = 0.000_218_580_87 + p * w;
        p = -0.001_253_725_03 + p * w;
        p = -0.004_177_681_64 + p * w;
        p = 0.246_640_727 + p * w;
        p = 1.501_409_41 + p * w;
        p * y
    } else {
        let w = w.sqrt() - 3.0;
        let mut p = -0.000_200_214_257;
        p = 0.000_100_950_558 + p * w;
        p = 0.001_349_343_22 + p * w;
        p = -0.003_673_428_44 + p * w;
        p = 0.005_739_507_73 + p * w;
        p = -0.007_622_461_3 + p * w;
        p = 0.009_438_870_47 + p * w;
        p = 1.001_674_06 + p * w;
        p = 2.832_976_82 + p * w;
        p * y
    };
    for _ in 0..3 {
        let err = erf(x) - y;
        let slope = 2.0 / PI.sqrt() * (-x * x).exp();
        if slope == 0.0 {
            break;
        }
        x -= err / slope;
    }
    x
}

/// Round half to even at `decimals` places
pub fn round_half_even(x: f64, decimals: i32) -> f64 {
    if !x.is_finite() {
        return x;
    }
    let scale = 10f64.powi(decimals);
    let y = x * scale;
    let floor = y.floor();
    let diff = y - floor;
    let r = if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if floor % 2.0 == 0.0 {
        floor
    } else {
        floor + 1.0
    };
    r / scale
}

/// Largest finite e4m3 value
const E4M3_MAX: f64 = 448.0;

/// Encode to the e4m3 byte: 1 sign, 4 exponent (bias 7) and 3 mantissa
/// bits, no infinities. Out-of-range values saturate to +-448.
pub fn to_e4m3(x: f64) -> u8 {
    let sign: u8 = if x.is_sign_negative() { 0x80 } else { 0 };
    if x.is_nan() {
        return sign | 0x7F;
    }
    let a = x.abs();
    if a >= E4M3_MAX {
        return sign | 0x7E;
    }
    let exp = a.log2().floor().max(-6.0);
    // 3 mantissa bits; subnormals share the step of exponent -6
    let step = 2f64.powf(exp - 3.0);
    let q = round_half_even(a / step, 0);
    let bits = if exp == -6.0 && q < 8.0 {
        q as u8
    } else {
        let (exp, man) = if q >= 16.0 { (exp + 1.0, 0.0) } else { (exp, q - 8.0) };
        (((exp + 7.0) as u8) << 3) | man as u8
    };
    sign | bits.min(0x7E)
}

pub fn from_e4m3(byte: u8) -> f64 {
    let sign = if byte & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = i32::from((byte >> 3) & 0x0F);
    let man = f64::from(byte & 0x07);
    if exp == 0x0F && man == 7.0 {
        return f64::NAN;
    }
    let magnitude = if exp == 0 {
        man / 8.0 * 2f64.powi(-6)
    } else {
        (1.0 + man / 8.0) * 2f64.powi(exp - 7)
    };
    sign * magnitude
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erf_values() {
        assert!((erf(0.5) - 0.520_499_877_813_046_5).abs() < 1e-13);
        assert!((erf(-1.0) + 0.842_700_792_949_714_9).abs() < 1e-13);
        assert!((erf(3.5) - 0.999_999_256_901_627_7).abs() < 1e-13);
        assert_eq!(erf(0.0), 0.0);
    }

    #[test]
    fn test_erfinv_inverts_erf() {
        for &y in &[-0.99, -0.5, 0.0, 0.1, 0.7, 0.999] {
            assert!((erf(erfinv(y)) - y).abs() < 1e-12, "y = {}", y);
        }
        assert_eq!(erfinv(1.0), f64::INFINITY);
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(round_half_even(2.5, 0), 2.0);
        assert_eq!(round_half_even(3.5, 0), 4.0);
        assert_eq!(round_half_even(-2.5, 0), -2.0);
        assert_eq!(round_half_even(1.26, 1), 1.3);
    }

    #[test]
    fn test_e4m3_exact_values_survive() {
        for v in [448.0, 256.0, 96.0, 3.0, 2.0, 0.015625, 0.001953125, 0.0, -12.0] {
            assert_eq!(from_e4m3(to_e4m3(v)), v, "{}", v);
        }
    }

    #[test]
    fn test_e4m3_rounding_and_saturation() {
        assert_eq!(to_e4m3(1.0), 0x38);
        // 1.0625 is halfway between 1.0 and 1.125
        assert_eq!(from_e4m3(to_e4m3(1.0625)), 1.0);
        assert_eq!(from_e4m3(to_e4m3(1000.0)), 448.0);
        assert_eq!(from_e4m3(to_e4m3(-1000.0)), -448.0);
        assert!(from_e4m3(to_e4m3(f64::NAN)).is_nan());
        assert_eq!(from_e4m3(0x01), 2f64.powi(-9));
    }
}
