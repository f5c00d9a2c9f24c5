//! Group-wise weight quantization.
//!
//! Codes are packed least-significant-bit first into a `uint32` stream per
//! row. The affine scheme stores a scale and bias per group in the weight
//! dtype; the fp4 schemes store an 8-bit scale per group (E8M0 for mxfp4,
//! E4M3 for nvfp4) and encode values as E2M1.

use mlx_engine::{Dtype, EngineError, EngineResult, QuantMode};

use crate::tensor::Tensor;

const E2M1: [f64; 8] = [0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0];

fn check_mode(op: &str, group_size: usize, bits: u32, mode: QuantMode) -> EngineResult<()> {
    let ok = match mode {
        QuantMode::Affine => matches!(bits, 2 | 3 | 4 | 5 | 6 | 8) && matches!(group_size, 32 | 64 | 128),
        QuantMode::Mxfp4 => bits == 4 && group_size == 32,
        QuantMode::Nvfp4 => bits == 4 && group_size == 16,
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::invalid(
            op,
            format!("{} quantization does not support group_size={} and bits={}", mode.name(), group_size, bits),
        ))
    }
}

// ============================================================================
// Codes
// ============================================================================

fn pack(codes: &[u32], bits: u32) -> Vec<f64> {
    let mut words = vec![0u32; codes.len() * bits as usize / 32];
    for (i, &c) in codes.iter().enumerate() {
        let offset = i * bits as usize;
        let (word, shift) = (offset / 32, offset % 32);
        words[word] |= c << shift;
        if shift + bits as usize > 32 {
            words[word + 1] |= c >> (32 - shift);
        }
    }
    words.into_iter().map(f64::from).collect()
}

fn unpack(words: &[f64], bits: u32, count: usize) -> Vec<u32> {
    let words: Vec<u32> = words.iter().map(|&w| w as u32).collect();
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
    (0..count)
        .map(|i| {
            let offset = i * bits as usize;
            let (word, shift) = (offset / 32, offset % 32);
            let mut c = words[word] >> shift;
            if shift + bits as usize > 32 {
                c |= words[word + 1] << (32 - shift);
            }
            c & mask
        })
        .collect()
}

fn e2m1_encode(x: f64) -> u32 {
    let idx = E2M1
        .iter()
        .enumerate()
        .min_by(|a, b| (a.1 - x.abs()).abs().total_cmp(&(b.1 - x.abs()).abs()))
        .map_or(0, |(i, _)| i as u32);
    if x < 0.0 {
        idx | 0b1000
    } else {
        idx
    }
}

fn e2m1_decode(code: u32) -> f64 {
    let v = E2M1[(code & 0b111) as usize];
    if code & 0b1000 != 0 {
        -v
    } else {
        v
    }
}

fn e4m3_encode(v: f64) -> u32 {
    let v = v.abs().min(448.0);
    if v == 0.0 || v.is_nan() {
        return 0;
    }
    let e = v.log2().floor() as i32;
    if e < -6 {
        return (v / 2f64.powi(-9)).round() as u32;
    }
    let mut e = e;
    let mut m = ((v / 2f64.powi(e) - 1.0) * 8.0).round() as u32;
    if m == 8 {
        e += 1;
        m = 0;
    }
    (((e + 7) as u32) << 3 | m).min(0x7E)
}

fn e4m3_decode(code: u32) -> f64 {
    let exp = (code >> 3) & 0xF;
    let m = (code & 7) as f64;
    if exp == 0 {
        m * 2f64.powi(-9)
    } else {
        (1.0 + m / 8.0) * 2f64.powi(exp as i32 - 7)
    }
}

// ============================================================================
// Quantize / dequantize
// ============================================================================

pub fn quantize(w: &Tensor, group_size: usize, bits: u32, mode: QuantMode) -> EngineResult<Vec<Tensor>> {
    check_mode("quantize", group_size, bits, mode)?;
    if w.ndim() < 2 {
        return Err(EngineError::invalid("quantize", "matrix must have at least 2 dimensions"));
    }
    if !w.dtype.is_floating() {
        return Err(EngineError::dtype("quantize", w.dtype));
    }
    let k = w.shape[w.ndim() - 1];
    if k % group_size != 0 || (k * bits as usize) % 32 != 0 {
        return Err(EngineError::invalid(
            "quantize",
            format!("last dimension {} must be divisible by the group size {}", k, group_size),
        ));
    }
    let rows = w.size() / k.max(1);
    let groups = k / group_size;
    let values = w.values();
    let mut packed = Vec::with_capacity(rows * k * bits as usize / 32);
    let mut scales = Vec::with_capacity(rows * groups);
    let mut biases = Vec::with_capacity(rows * groups);
    let levels = ((1u64 << bits) - 1) as f64;
    for r in 0..rows {
        let row = &values[r * k..(r + 1) * k];
        let mut codes = Vec::with_capacity(k);
        for group in row.chunks(group_size) {
            match mode {
                QuantMode::Affine => {
                    let lo = group.iter().copied().fold(f64::INFINITY, f64::min);
                    let hi = group.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    let scale = (hi - lo) / levels;
                    for &x in group {
                        let q = if scale > 0.0 { ((x - lo) / scale).round().clamp(0.0, levels) } else { 0.0 };
                        codes.push(q as u32);
                    }
                    scales.push(scale);
                    biases.push(lo);
                }
                QuantMode::Mxfp4 | QuantMode::Nvfp4 => {
                    let amax = group.iter().fold(0.0f64, |m, x| m.max(x.abs()));
                    let (code, scale) = if mode == QuantMode::Mxfp4 {
                        let e = if amax > 0.0 { (amax.log2().floor() as i32 - 2).clamp(-127, 127) } else { -127 };
                        ((e + 127) as u32, 2f64.powi(e))
                    } else {
                        let c = e4m3_encode(amax / 6.0);
                        (c, e4m3_decode(c))
                    };
                    for &x in group {
                        codes.push(if scale > 0.0 { e2m1_encode(x / scale) } else { 0 });
                    }
                    scales.push(code as f64);
                }
            }
        }
        packed.extend(pack(&codes, bits));
    }
    let lead = &w.shape[..w.ndim() - 1];
    let with_last = |n: usize| {
        let mut s = lead.to_vec();
        s.push(n);
        s
    };
    let wq = Tensor::real(with_last(k * bits as usize / 32), Dtype::Uint32, packed);
    if mode == QuantMode::Affine {
        Ok(vec![
            wq,
            Tensor::real(with_last(groups), w.dtype, scales),
            Tensor::real(with_last(groups), w.dtype, biases),
        ])
    } else {
        Ok(vec![wq, Tensor::real(with_last(groups), Dtype::Uint8, scales)])
    }
}

pub fn dequantize(
    wq: &Tensor,
    scales: &Tensor,
    biases: Option<&Tensor>,
    group_size: usize,
    bits: u32,
    mode: QuantMode,
    dtype: Option<Dtype>,
) -> EngineResult<Tensor> {
    check_mode("dequantize", group_size, bits, mode)?;
    if wq.dtype != Dtype::Uint32 {
        return Err(EngineError::invalid("dequantize", format!("packed weights must be uint32, got {}", wq.dtype)));
    }
    if mode == QuantMode::Affine && biases.is_none() {
        return Err(EngineError::invalid("dequantize", "affine quantization requires biases"));
    }
    let words = wq.shape.last().copied().unwrap_or(0);
    let k = words * 32 / bits as usize;
    let groups = scales.shape.last().copied().unwrap_or(0);
    if wq.ndim() != scales.ndim() || groups * group_size != k {
        return Err(EngineError::invalid(
            "dequantize",
            format!("shape of scales {:?} does not match packed weights {:?}", scales.shape, wq.shape),
        ));
    }
    let rows = wq.size() / words.max(1);
    let wv = wq.values();
    let sv = scales.values();
    let bv = biases.map(|b| b.values().into_owned());
    let mut out = Vec::with_capacity(rows * k);
    for r in 0..rows {
        let codes = unpack(&wv[r * words..(r + 1) * words], bits, k);
        for (i, &c) in codes.iter().enumerate() {
            let g = r * groups + i / group_size;
            out.push(match mode {
                QuantMode::Affine => {
                    let bias = bv.as_ref().map_or(0.0, |b| b[g]);
                    c as f64 * sv[g] + bias
                }
                QuantMode::Mxfp4 => e2m1_decode(c) * 2f64.powi(sv[g] as i32 - 127),
                QuantMode::Nvfp4 => e2m1_decode(c) * e4m3_decode(sv[g] as u32),
            });
        }
    }
    let default = if mode == QuantMode::Affine { scales.dtype } else { Dtype::Float32 };
    let mut shape = wq.shape.clone();
    if let Some(last) = shape.last_mut() {
        *last = k;
    }
    Ok(Tensor::real(shape, dtype.unwrap_or(default), out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ramp(k: usize) -> Tensor {
        Tensor::real(vec![2, k], Dtype::Float32, (0..2 * k).map(|i| i as f64 / 8.0 - 4.0).collect())
    }

    #[test]
    fn test_pack_unpack_crosses_words() {
        let codes: Vec<u32> = (0..32).map(|i| i % 8).collect();
        let words = pack(&codes, 3);
        assert_eq!(words.len(), 3);
        assert_eq!(unpack(&words, 3, 32), codes);
    }

    #[test]
    fn test_affine_output_shapes() {
        let out = quantize(&ramp(64), 32, 4, QuantMode::Affine).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].shape, vec![2, 8]);
        assert_eq!(out[0].dtype, Dtype::Uint32);
        assert_eq!(out[1].shape, vec![2, 2]);
        assert_eq!(out[1].dtype, Dtype::Float32);
    }

    #[test]
    fn test_affine_error_within_half_step() {
        let w = ramp(64);
        let q = quantize(&w, 64, 8, QuantMode::Affine).unwrap();
        let back = dequantize(&q[0], &q[1], Some(&q[2]), 64, 8, QuantMode::Affine, None).unwrap();
        let step = q[1].values().iter().fold(0.0f64, |m, &s| m.max(s));
        for (a, b) in w.values().iter().zip(back.values().iter()) {
            assert!((a - b).abs() <= step / 2.0 + 1e-6);
        }
    }

    #[test]
    fn test_fp4_modes() {
        let w = ramp(32);
        let q = quantize(&w, 32, 4, QuantMode::Mxfp4).unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q[1].dtype, Dtype::Uint8);
        let back = dequantize(&q[0], &q[1], None, 32, 4, QuantMode::Mxfp4, None).unwrap();
        assert_eq!(back.shape, vec![2, 32]);
        // exactly representable values survive
        assert_eq!(back.values()[0], -4.0);

        let q = quantize(&ramp(16), 16, 4, QuantMode::Nvfp4).unwrap();
        assert_eq!(q[1].shape, vec![2, 1]);
    }

    #[test]
    fn test_e4m3_round_trip() {
        for v in [0.0, 0.015625, 0.5, 1.0, 1.125, 240.0, 448.0] {
            assert_eq!(e4m3_decode(e4m3_encode(v)), v);
        }
    }

    #[test]
    fn test_rejects_bad_group() {
        assert!(quantize(&ramp(64), 48, 4, QuantMode::Affine).is_err());
        assert!(quantize(&ramp(64), 64, 4, QuantMode::Mxfp4).is_err());
    }
}
