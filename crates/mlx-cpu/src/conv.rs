//! Direct N-d convolution over channels-last data.

use mlx_engine::{promote_types, ConvParams, EngineError, EngineResult};

use crate::tensor::{increment, strides, Tensor};

/// For each output position and kernel tap along one axis, the input index read
fn axis_taps(in_len: usize, k_len: usize, out_len: usize, axis: usize, p: &ConvParams) -> Vec<Vec<Option<usize>>> {
    let (stride, kdil, idil) = (p.stride[axis], p.kernel_dilation[axis], p.input_dilation[axis]);
    let lo = p.padding_lo[axis] as i64;
    (0..out_len)
        .map(|o| {
            (0..k_len)
                .map(|k| {
                    let k = if p.flip { k_len - 1 - k } else { k };
                    let pos = (o * stride + k * kdil) as i64 - lo;
                    if pos < 0 || pos % idil as i64 != 0 {
                        return None;
                    }
                    let i = (pos / idil as i64) as usize;
                    (i < in_len).then_some(i)
                })
                .collect()
        })
        .collect()
}

fn out_len(in_len: usize, k_len: usize, axis: usize, p: &ConvParams) -> EngineResult<usize> {
    let dilated_in = if in_len == 0 { 0 } else { (in_len - 1) * p.input_dilation[axis] + 1 };
    let padded = dilated_in + p.padding_lo[axis] + p.padding_hi[axis];
    let span = p.kernel_dilation[axis] * k_len.saturating_sub(1) + 1;
    if padded < span || p.stride[axis] == 0 {
        return Err(EngineError::invalid(
            "conv",
            format!("kernel of size {} does not fit the padded input of size {} on spatial axis {}", span, padded, axis),
        ));
    }
    Ok((padded - span) / p.stride[axis] + 1)
}

pub fn conv_general(input: &Tensor, weight: &Tensor, p: &ConvParams) -> EngineResult<Tensor> {
    if input.is_complex() || weight.is_complex() {
        return Err(EngineError::dtype("conv", mlx_engine::Dtype::Complex64));
    }
    if input.ndim() < 3 || input.ndim() != weight.ndim() {
        return Err(EngineError::invalid(
            "conv",
            format!("input {:?} and weight {:?} must have the same rank of at least 3", input.shape, weight.shape),
        ));
    }
    let spatial = input.ndim() - 2;
    let lists = [&p.stride, &p.padding_lo, &p.padding_hi, &p.kernel_dilation, &p.input_dilation];
    if lists.iter().any(|l| l.len() != spatial) {
        return Err(EngineError::invalid("conv", format!("parameters must have {} entries", spatial)));
    }
    let batch = input.shape[0];
    let c_in = input.shape[spatial + 1];
    let c_out = weight.shape[0];
    let groups = p.groups.max(1);
    let c_in_group = weight.shape[spatial + 1];
    if c_in_group * groups != c_in || c_out % groups != 0 {
        return Err(EngineError::invalid(
            "conv",
            format!("{} input channels do not match weight {:?} with {} groups", c_in, weight.shape, groups),
        ));
    }
    let in_sp = &input.shape[1..=spatial];
    let k_sp = &weight.shape[1..=spatial];
    let out_sp = (0..spatial)
        .map(|d| out_len(in_sp[d], k_sp[d], d, p))
        .collect::<EngineResult<Vec<_>>>()?;
    let taps: Vec<_> = (0..spatial).map(|d| axis_taps(in_sp[d], k_sp[d], out_sp[d], d, p)).collect();

    let in_st = strides(&input.shape);
    let w_st = strides(&weight.shape);
    let (x, w) = (input.values(), weight.values());
    let c_out_group = c_out / groups;
    let mut shape = vec![batch];
    shape.extend_from_slice(&out_sp);
    shape.push(c_out);
    let mut out = Vec::with_capacity(shape.iter().product());
    let kernel_size: usize = k_sp.iter().product();

    for n in 0..batch {
        if out_sp.iter().product::<usize>() == 0 {
            break;
        }
        let mut o_idx = vec![0usize; spatial];
        loop {
            for co in 0..c_out {
                let g = co / c_out_group;
                let mut acc = 0.0;
                if kernel_size > 0 {
                    let mut k_idx = vec![0usize; spatial];
                    loop {
                        let mut in_pos = Some(n * in_st[0]);
                        let mut w_pos = co * w_st[0];
                        for d in 0..spatial {
                            in_pos = match (in_pos, taps[d][o_idx[d]][k_idx[d]]) {
                                (Some(pos), Some(i)) => Some(pos + i * in_st[d + 1]),
                                _ => None,
                            };
                            w_pos += k_idx[d] * w_st[d + 1];
                        }
                        if let Some(pos) = in_pos {
                            for ci in 0..c_in_group {
                                acc += x[pos + g * c_in_group + ci] * w[w_pos + ci];
                            }
                        }
                        if !increment(&mut k_idx, k_sp) {
                            break;
                        }
                    }
                }
                out.push(acc);
            }
            if !increment(&mut o_idx, &out_sp) {
                break;
            }
        }
    }
    Ok(Tensor::real(shape, promote_types(input.dtype, weight.dtype), out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_engine::Dtype;
    use pretty_assertions::assert_eq;

    fn params(spatial: usize) -> ConvParams {
        ConvParams {
            stride: vec![1; spatial],
            padding_lo: vec![0; spatial],
            padding_hi: vec![0; spatial],
            kernel_dilation: vec![1; spatial],
            input_dilation: vec![1; spatial],
            groups: 1,
            flip: false,
        }
    }

    fn t(shape: &[usize], values: &[f64]) -> Tensor {
        Tensor::real(shape.to_vec(), Dtype::Float32, values.to_vec())
    }

    #[test]
    fn test_conv1d_valid() {
        let x = t(&[1, 4, 1], &[1.0, 2.0, 3.0, 4.0]);
        let w = t(&[1, 2, 1], &[1.0, -1.0]);
        let out = conv_general(&x, &w, &params(1)).unwrap();
        assert_eq!(out.shape, vec![1, 3, 1]);
        assert_eq!(out.values().to_vec(), vec![-1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_padding_stride_and_flip() {
        let x = t(&[1, 3, 1], &[1.0, 2.0, 3.0]);
        let w = t(&[1, 2, 1], &[1.0, 10.0]);
        let mut p = params(1);
        p.padding_lo = vec![1];
        p.padding_hi = vec![1];
        p.stride = vec![2];
        let out = conv_general(&x, &w, &p).unwrap();
        assert_eq!(out.values().to_vec(), vec![10.0, 32.0]);
        p.flip = true;
        let out = conv_general(&x, &w, &p).unwrap();
        assert_eq!(out.values().to_vec(), vec![1.0, 23.0]);
    }

    #[test]
    fn test_input_dilation() {
        let x = t(&[1, 2, 1], &[1.0, 2.0]);
        let w = t(&[1, 1, 1], &[1.0]);
        let mut p = params(1);
        p.input_dilation = vec![2];
        let out = conv_general(&x, &w, &p).unwrap();
        assert_eq!(out.values().to_vec(), vec![1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_grouped_channels() {
        let x = t(&[1, 1, 2], &[3.0, 5.0]);
        let w = t(&[2, 1, 1], &[2.0, 10.0]);
        let mut p = params(1);
        p.groups = 2;
        let out = conv_general(&x, &w, &p).unwrap();
        assert_eq!(out.values().to_vec(), vec![6.0, 50.0]);
    }

    #[test]
    fn test_kernel_larger_than_input() {
        let x = t(&[1, 1, 1], &[1.0]);
        let w = t(&[1, 3, 1], &[1.0, 1.0, 1.0]);
        assert!(conv_general(&x, &w, &params(1)).is_err());
    }
}
