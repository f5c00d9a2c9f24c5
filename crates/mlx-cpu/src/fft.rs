//! Discrete Fourier transforms, one axis at a time.
//!
//! Each axis is planned once with [`FftPlanner`] and every lane along it
//! runs through the same plan.

use mlx_engine::{EngineError, EngineResult, FftOp};
use rustfft::FftPlanner;

use crate::tensor::{lanes, strides, Tensor, C64};

/// Crop or zero-pad `axis` to `len`
fn resize_axis(data: &[C64], shape: &[usize], axis: usize, len: usize) -> (Vec<C64>, Vec<usize>) {
    let mut out_shape = shape.to_vec();
    out_shape[axis] = len;
    let outer: usize = shape[..axis].iter().product();
    let inner: usize = shape[axis + 1..].iter().product();
    let old = shape[axis];
    let mut out = vec![C64::new(0.0, 0.0); outer * len * inner];
    for o in 0..outer {
        for i in 0..old.min(len) {
            let src = (o * old + i) * inner;
            let dst = (o * len + i) * inner;
            out[dst..dst + inner].copy_from_slice(&data[src..src + inner]);
        }
    }
    (out, out_shape)
}

/// Complex transform of every lane along `axis`
fn dft_axis(data: &mut [C64], shape: &[usize], axis: usize, inverse: bool) {
    let n = shape[axis];
    let step = strides(shape)[axis];
    let mut planner = FftPlanner::<f64>::new();
    let plan = if inverse { planner.plan_fft_inverse(n) } else { planner.plan_fft_forward(n) };
    // rustfft leaves the inverse unnormalized
    let scale = if inverse { 1.0 / n as f64 } else { 1.0 };
    let mut lane = vec![C64::new(0.0, 0.0); n];
    for base in lanes(shape, axis) {
        for (t, x) in lane.iter_mut().enumerate() {
            *x = data[base + t * step];
        }
        plan.process(&mut lane);
        for (k, x) in lane.iter().enumerate() {
            data[base + k * step] = *x * scale;
        }
    }
}

/// Real-input transform along `axis` keeping the `n / 2 + 1` non-negative bins
fn rfft_axis(data: &[C64], shape: &[usize], axis: usize) -> (Vec<C64>, Vec<usize>) {
    let mut full = data.to_vec();
    dft_axis(&mut full, shape, axis, false);
    let n = shape[axis];
    resize_axis(&full, shape, axis, n / 2 + 1)
}

/// Inverse of [`rfft_axis`] producing `n` real samples along `axis`
fn irfft_axis(data: &[C64], shape: &[usize], axis: usize, n: usize) -> (Vec<f64>, Vec<usize>) {
    let (bins, bin_shape) = resize_axis(data, shape, axis, n / 2 + 1);
    let mut out_shape = shape.to_vec();
    out_shape[axis] = n;
    let in_step = strides(&bin_shape)[axis];
    let out_step = strides(&out_shape)[axis];
    let mut out = vec![0.0; out_shape.iter().product()];
    let half = n / 2 + 1;
    let plan = FftPlanner::<f64>::new().plan_fft_inverse(n);
    let in_lanes = lanes(&bin_shape, axis);
    let out_lanes = lanes(&out_shape, axis);
    let mut spectrum = vec![C64::new(0.0, 0.0); n];
    for (&ib, &ob) in in_lanes.iter().zip(&out_lanes) {
        // Hermitian extension of the non-negative bins
        for (k, x) in spectrum.iter_mut().enumerate() {
            *x = if k < half { bins[ib + k * in_step] } else { bins[ib + (n - k) * in_step].conj() };
        }
        plan.process(&mut spectrum);
        for (t, x) in spectrum.iter().enumerate() {
            out[ob + t * out_step] = x.re / n as f64;
        }
    }
    (out, out_shape)
}

pub fn fft(a: &Tensor, n: &[usize], axes: &[usize], op: FftOp) -> EngineResult<Tensor> {
    if n.len() != axes.len() {
        return Err(EngineError::invalid("fft", "one length is required per axis"));
    }
    if axes.iter().any(|&ax| ax >= a.ndim()) {
        return Err(EngineError::invalid("fft", format!("axes {:?} are out of bounds", axes)));
    }
    if n.contains(&0) {
        return Err(EngineError::invalid("fft", format!("invalid output lengths {:?}", n)));
    }
    let mut shape = a.shape.clone();
    let mut data = a.complex_values().into_owned();
    match (op.real, op.inverse) {
        (false, inverse) => {
            for (&ax, &len) in axes.iter().zip(n) {
                let (d, s) = resize_axis(&data, &shape, ax, len);
                data = d;
                shape = s;
                dft_axis(&mut data, &shape, ax, inverse);
            }
            Ok(Tensor::complex(shape, data))
        }
        (true, false) => {
            if a.is_complex() {
                return Err(EngineError::dtype("rfft", a.dtype));
            }
            let last = axes.len() - 1;
            let (d, s) = resize_axis(&data, &shape, axes[last], n[last]);
            let (d, s) = rfft_axis(&d, &s, axes[last]);
            data = d;
            shape = s;
            for (&ax, &len) in axes[..last].iter().zip(n) {
                let (d, s) = resize_axis(&data, &shape, ax, len);
                data = d;
                shape = s;
                dft_axis(&mut data, &shape, ax, false);
            }
            Ok(Tensor::complex(shape, data))
        }
        (true, true) => {
            let last = axes.len() - 1;
            for (&ax, &len) in axes[..last].iter().zip(n) {
                let (d, s) = resize_axis(&data, &shape, ax, len);
                data = d;
                shape = s;
                dft_axis(&mut data, &shape, ax, true);
            }
            let (values, shape) = irfft_axis(&data, &shape, axes[last], n[last]);
            Ok(Tensor::real(shape, mlx_engine::Dtype::Float32, values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_engine::Dtype;
    use pretty_assertions::assert_eq;

    const FORWARD: FftOp = FftOp { inverse: false, real: false };
    const INVERSE: FftOp = FftOp { inverse: true, real: false };
    const RFFT: FftOp = FftOp { inverse: false, real: true };
    const IRFFT: FftOp = FftOp { inverse: true, real: true };

    fn real(values: &[f64]) -> Tensor {
        Tensor::real(vec![values.len()], Dtype::Float32, values.to_vec())
    }

    #[test]
    fn test_forward_of_impulse_is_flat() {
        let out = fft(&real(&[1.0, 0.0, 0.0, 0.0]), &[4], &[0], FORWARD).unwrap();
        assert_eq!(out.dtype, Dtype::Complex64);
        assert!(out.complex_values().iter().all(|c| (c.re - 1.0).abs() < 1e-6 && c.im.abs() < 1e-6));
    }

    #[test]
    fn test_inverse_round_trip() {
        let x = real(&[1.0, 2.0, 3.0, 4.0]);
        let f = fft(&x, &[4], &[0], FORWARD).unwrap();
        let back = fft(&f, &[4], &[0], INVERSE).unwrap();
        for (c, e) in back.complex_values().iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert!((c.re - e).abs() < 1e-5 && c.im.abs() < 1e-5);
        }
    }

    #[test]
    fn test_rfft_bins_and_irfft() {
        let x = real(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let f = fft(&x, &[5], &[0], RFFT).unwrap();
        assert_eq!(f.shape, vec![3]);
        assert!((f.complex_values()[0].re - 15.0).abs() < 1e-5);
        let back = fft(&f, &[5], &[0], IRFFT).unwrap();
        assert_eq!(back.dtype, Dtype::Float32);
        for (v, e) in back.values().iter().zip([1.0, 2.0, 3.0, 4.0, 5.0]) {
            assert!((v - e).abs() < 1e-5);
        }
    }

    #[test]
    fn test_padding_and_cropping() {
        let x = real(&[1.0, 1.0]);
        assert_eq!(fft(&x, &[4], &[0], FORWARD).unwrap().shape, vec![4]);
        let cropped = fft(&x, &[1], &[0], FORWARD).unwrap();
        assert_eq!(cropped.complex_values()[0].re, 1.0);
        assert!(fft(&x, &[0], &[0], FORWARD).is_err());
    }

    #[test]
    fn test_matches_direct_sum_on_odd_length() {
        let values = [0.5, -1.0, 2.0, 0.25, 3.0, -0.75, 1.5];
        let n = values.len();
        let out = fft(&real(&values), &[n], &[0], FORWARD).unwrap();
        for (k, got) in out.complex_values().iter().enumerate() {
            let expected: C64 = values
                .iter()
                .enumerate()
                .map(|(t, &x)| {
                    let angle = -2.0 * std::f64::consts::PI * (k * t) as f64 / n as f64;
                    C64::new(angle.cos(), angle.sin()) * x
                })
                .sum();
            assert!((got - expected).norm() < 1e-4, "bin {}: {} vs {}", k, got, expected);
        }
    }

    #[test]
    fn test_second_axis_of_matrix() {
        let x = Tensor::real(vec![2, 4], Dtype::Float32, vec![1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]);
        let out = fft(&x, &[4], &[1], FORWARD).unwrap();
        let c = out.complex_values();
        assert!(c[..4].iter().all(|v| (v.re - 1.0).abs() < 1e-6 && v.im.abs() < 1e-6));
        assert!((c[4].re - 4.0).abs() < 1e-6);
        assert!(c[5..].iter().all(|v| v.norm() < 1e-6));
    }
}
