//! Shape and indexing kernels, plus matrix multiplication.

use std::ops::{Add, Mul};

use mlx_engine::ops::broadcast_shapes;
use mlx_engine::{promote_types, Dtype, EngineError, EngineResult, PadMode};

use crate::tensor::{broadcast_map, from_bytes, increment, strides, to_bytes, unravel, Data, Tensor};

pub fn reshape(a: &Tensor, shape: &[usize]) -> EngineResult<Tensor> {
    let size: usize = shape.iter().product();
    if size != a.size() {
        return Err(EngineError::invalid(
            "reshape",
            format!("cannot reshape array of size {} into shape {:?}", a.size(), shape),
        ));
    }
    Ok(a.with_shape(shape.to_vec()))
}

pub fn transpose(a: &Tensor, perm: &[usize]) -> EngineResult<Tensor> {
    let mut seen = vec![false; a.ndim()];
    if perm.len() != a.ndim() || perm.iter().any(|&p| p >= a.ndim() || std::mem::replace(&mut seen[p], true)) {
        return Err(EngineError::invalid(
            "transpose",
            format!("{:?} is not a permutation of the axes of an array with {} dimensions", perm, a.ndim()),
        ));
    }
    let in_strides = strides(&a.shape);
    let shape: Vec<usize> = perm.iter().map(|&p| a.shape[p]).collect();
    let eff: Vec<usize> = perm.iter().map(|&p| in_strides[p]).collect();
    Ok(a.gather(shape.clone(), &strided_positions(&shape, &eff, 0)))
}

// source positions for an index walk with per-axis element strides
fn strided_positions(shape: &[usize], eff: &[usize], offset: usize) -> Vec<usize> {
    let size: usize = shape.iter().product();
    let mut out = Vec::with_capacity(size);
    if size == 0 {
        return out;
    }
    let mut index = vec![0usize; shape.len()];
    loop {
        out.push(offset + index.iter().zip(eff).map(|(i, s)| i * s).sum::<usize>());
        if !increment(&mut index, shape) {
            return out;
        }
    }
}

pub fn broadcast_to(a: &Tensor, shape: &[usize]) -> EngineResult<Tensor> {
    let map = broadcast_map("broadcast_to", &a.shape, shape)?;
    Ok(a.gather(shape.to_vec(), &map))
}

pub fn concatenate(arrays: &[&Tensor], axis: usize) -> EngineResult<Tensor> {
    let first = arrays
        .first()
        .ok_or_else(|| EngineError::invalid("concatenate", "no arrays provided"))?;
    if axis >= first.ndim() {
        return Err(EngineError::invalid("concatenate", format!("axis {} is out of bounds", axis)));
    }
    let mut dtype = first.dtype;
    let mut total = 0;
    for a in arrays {
        let same_rank = a.ndim() == first.ndim();
        if !same_rank || a.shape.iter().zip(&first.shape).enumerate().any(|(d, (x, y))| d != axis && x != y) {
            return Err(EngineError::invalid(
                "concatenate",
                format!("all input shapes must match except along axis {}: {:?} vs {:?}", axis, first.shape, a.shape),
            ));
        }
        dtype = promote_types(dtype, a.dtype);
        total += a.shape[axis];
    }
    let mut shape = first.shape.clone();
    shape[axis] = total;
    let outer: usize = first.shape[..axis].iter().product();
    let inner: usize = first.shape[axis + 1..].iter().product();
    if dtype.is_complex() {
        let mut out = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for a in arrays {
                let chunk = a.shape[axis] * inner;
                out.extend_from_slice(&a.complex_values()[o * chunk..(o + 1) * chunk]);
            }
        }
        return Ok(Tensor::complex(shape, out));
    }
    let mut out = Vec::with_capacity(shape.iter().product());
    for o in 0..outer {
        for a in arrays {
            let chunk = a.shape[axis] * inner;
            out.extend_from_slice(&a.values()[o * chunk..(o + 1) * chunk]);
        }
    }
    Ok(Tensor::real(shape, dtype, out))
}

// ============================================================================
// Slicing
// ============================================================================

/// Selected positions along each axis
fn slice_positions(op: &str, shape: &[usize], start: &[i64], stop: &[i64], step: &[i64]) -> EngineResult<Vec<Vec<usize>>> {
    if start.len() != shape.len() || stop.len() != shape.len() || step.len() != shape.len() {
        return Err(EngineError::invalid(
            op,
            format!("start, stop and strides must have {} entries", shape.len()),
        ));
    }
    let mut out = Vec::with_capacity(shape.len());
    for d in 0..shape.len() {
        let len = shape[d] as i64;
        let s = step[d];
        if s == 0 {
            return Err(EngineError::invalid(op, "slice step cannot be zero"));
        }
        let mut positions = Vec::new();
        if s > 0 {
            let (mut i, end) = (start[d].clamp(0, len), stop[d].clamp(0, len));
            while i < end {
                positions.push(i as usize);
                i += s;
            }
        } else {
            let (mut i, end) = (start[d].clamp(-1, len - 1), stop[d].clamp(-1, len - 1));
            while i > end {
                positions.push(i as usize);
                i += s;
            }
        }
        out.push(positions);
    }
    Ok(out)
}

fn cartesian_flat(shape: &[usize], positions: &[Vec<usize>]) -> (Vec<usize>, Vec<usize>) {
    let st = strides(shape);
    let out_shape: Vec<usize> = positions.iter().map(Vec::len).collect();
    let size: usize = out_shape.iter().product();
    let mut flat = Vec::with_capacity(size);
    if size > 0 {
        let mut index = vec![0usize; shape.len()];
        loop {
            flat.push(index.iter().enumerate().map(|(d, &i)| positions[d][i] * st[d]).sum());
            if !increment(&mut index, &out_shape) {
                break;
            }
        }
    }
    (out_shape, flat)
}

pub fn slice(a: &Tensor, start: &[i64], stop: &[i64], step: &[i64]) -> EngineResult<Tensor> {
    let positions = slice_positions("slice", &a.shape, start, stop, step)?;
    let (shape, flat) = cartesian_flat(&a.shape, &positions);
    Ok(a.gather(shape, &flat))
}

pub fn slice_update(a: &Tensor, update: &Tensor, start: &[i64], stop: &[i64], step: &[i64]) -> EngineResult<Tensor> {
    let positions = slice_positions("slice_update", &a.shape, start, stop, step)?;
    let (shape, flat) = cartesian_flat(&a.shape, &positions);
    let map = broadcast_map("slice_update", &update.shape, &shape)?;
    scatter(a, update, &flat, &map)
}

// write `src[map[k]]` to `dst[flat[k]]`, keeping the dtype of `dst`
fn scatter(dst: &Tensor, src: &Tensor, flat: &[usize], map: &[usize]) -> EngineResult<Tensor> {
    let data = match &dst.data {
        Data::Complex(v) => {
            let mut out = v.clone();
            let sv = src.complex_values();
            for (&f, &m) in flat.iter().zip(map) {
                out[f] = sv[m];
            }
            Data::Complex(out)
        }
        Data::Real(v) => {
            if src.is_complex() {
                return Err(EngineError::dtype("slice_update", src.dtype));
            }
            let mut out = v.clone();
            let sv = src.values();
            for (&f, &m) in flat.iter().zip(map) {
                out[f] = sv[m];
            }
            Data::Real(out)
        }
    };
    Ok(Tensor::new(dst.shape.clone(), dst.dtype, data))
}

// ============================================================================
// Gathers and scatters
// ============================================================================

fn wrap_index(op: &str, i: f64, len: usize) -> EngineResult<usize> {
    let n = len as i64;
    let i = i as i64;
    let w = if i < 0 { i + n } else { i };
    if w < 0 || w >= n {
        return Err(EngineError::invalid(
            op,
            format!("index {} is out of bounds for axis with size {}", i, len),
        ));
    }
    Ok(w as usize)
}

fn check_indices(op: &str, indices: &Tensor) -> EngineResult<()> {
    if indices.dtype.is_integer() {
        Ok(())
    } else {
        Err(EngineError::invalid(op, format!("indices must be integers, got {}", indices.dtype)))
    }
}

pub fn take(a: &Tensor, indices: &Tensor, axis: usize) -> EngineResult<Tensor> {
    check_indices("take", indices)?;
    if axis >= a.ndim() {
        return Err(EngineError::invalid("take", format!("axis {} is out of bounds", axis)));
    }
    let st = strides(&a.shape);
    let outer: usize = a.shape[..axis].iter().product();
    let inner: usize = a.shape[axis + 1..].iter().product();
    let idx: Vec<usize> = indices
        .values()
        .iter()
        .map(|&i| wrap_index("take", i, a.shape[axis]))
        .collect::<EngineResult<_>>()?;
    let mut flat = Vec::with_capacity(outer * idx.len() * inner);
    for o in 0..outer {
        for &i in &idx {
            for k in 0..inner {
                flat.push(o * a.shape[axis] * st[axis] + i * st[axis] + k);
            }
        }
    }
    let mut shape = a.shape[..axis].to_vec();
    shape.extend_from_slice(&indices.shape);
    shape.extend_from_slice(&a.shape[axis + 1..]);
    Ok(a.gather(shape, &flat))
}

// shape of the index walk for *_along_axis: broadcast everywhere but `axis`
fn along_shape(op: &str, a: &[usize], idx: &[usize], axis: usize) -> EngineResult<Vec<usize>> {
    if a.len() != idx.len() {
        return Err(EngineError::invalid(op, "indices must have the same number of dimensions as the array"));
    }
    if axis >= a.len() {
        return Err(EngineError::invalid(op, format!("axis {} is out of bounds", axis)));
    }
    let mut a_wo = a.to_vec();
    let mut i_wo = idx.to_vec();
    a_wo[axis] = 1;
    i_wo[axis] = 1;
    let mut shape = broadcast_shapes(op, &a_wo, &i_wo)?;
    shape[axis] = idx[axis];
    Ok(shape)
}

// flat positions in `a` addressed by each element of the broadcast index walk
fn along_positions(op: &str, a: &Tensor, indices: &Tensor, axis: usize, shape: &[usize]) -> EngineResult<Vec<usize>> {
    let idx_map = broadcast_map(op, &indices.shape, shape)?;
    let iv = indices.values();
    let st = strides(&a.shape);
    let mut index = vec![0usize; shape.len()];
    let mut out = Vec::with_capacity(idx_map.len());
    for (k, &m) in idx_map.iter().enumerate() {
        unravel(k, shape, &mut index);
        let along = wrap_index(op, iv[m], a.shape[axis])?;
        let mut pos = 0;
        for d in 0..shape.len() {
            let i = if d == axis {
                along
            } else if a.shape[d] == 1 {
                0
            } else {
                index[d]
            };
            pos += i * st[d];
        }
        out.push(pos);
    }
    Ok(out)
}

pub fn take_along_axis(a: &Tensor, indices: &Tensor, axis: usize) -> EngineResult<Tensor> {
    check_indices("take_along_axis", indices)?;
    let shape = along_shape("take_along_axis", &a.shape, &indices.shape, axis)?;
    let flat = along_positions("take_along_axis", a, indices, axis, &shape)?;
    Ok(a.gather(shape, &flat))
}

pub fn put_along_axis(a: &Tensor, indices: &Tensor, values: &Tensor, axis: usize) -> EngineResult<Tensor> {
    check_indices("put_along_axis", indices)?;
    let shape = along_shape("put_along_axis", &a.shape, &indices.shape, axis)?;
    if shape.iter().zip(&a.shape).enumerate().any(|(d, (s, n))| d != axis && s != n) {
        return Err(EngineError::invalid("put_along_axis", "indices do not match the array outside the axis"));
    }
    let flat = along_positions("put_along_axis", a, indices, axis, &shape)?;
    let map = broadcast_map("put_along_axis", &values.shape, &shape)?;
    scatter(a, values, &flat, &map)
}

pub fn pad(a: &Tensor, low: &[usize], high: &[usize], value: &Tensor, mode: PadMode) -> EngineResult<Tensor> {
    if low.len() != a.ndim() || high.len() != a.ndim() {
        return Err(EngineError::invalid("pad", format!("padding must have {} entries", a.ndim())));
    }
    if value.size() != 1 {
        return Err(EngineError::invalid("pad", "pad value must be a scalar"));
    }
    if mode == PadMode::Edge && a.shape.iter().zip(low.iter().zip(high)).any(|(&d, (&l, &h))| d == 0 && l + h > 0) {
        return Err(EngineError::invalid("pad", "cannot edge-pad an empty axis"));
    }
    let shape: Vec<usize> = (0..a.ndim()).map(|d| a.shape[d] + low[d] + high[d]).collect();
    let st = strides(&a.shape);
    let size: usize = shape.iter().product();
    // source position, or None for the fill value
    let mut sources: Vec<Option<usize>> = Vec::with_capacity(size);
    if size > 0 {
        let mut index = vec![0usize; shape.len()];
        loop {
            let mut pos = Some(0usize);
            for d in 0..shape.len() {
                let i = index[d] as i64 - low[d] as i64;
                let n = a.shape[d] as i64;
                let src = match mode {
                    PadMode::Constant if i < 0 || i >= n => None,
                    PadMode::Constant => Some(i as usize),
                    PadMode::Edge => Some(i.clamp(0, n - 1) as usize),
                };
                pos = match (pos, src) {
                    (Some(p), Some(s)) => Some(p + s * st[d]),
                    _ => None,
                };
            }
            sources.push(pos);
            if !increment(&mut index, &shape) {
                break;
            }
        }
    }
    let dtype = a.dtype;
    if a.is_complex() {
        let (av, fill) = (a.complex_values(), value.complex_values()[0]);
        let values = sources.iter().map(|s| s.map_or(fill, |p| av[p])).collect();
        return Ok(Tensor::complex(shape, values));
    }
    let (av, fill) = (a.values(), value.values()[0]);
    let values = sources.iter().map(|s| s.map_or(fill, |p| av[p])).collect();
    Ok(Tensor::real(shape, dtype, values))
}

pub fn as_strided(a: &Tensor, shape: &[usize], st: &[i64], offset: usize) -> EngineResult<Tensor> {
    if shape.len() != st.len() {
        return Err(EngineError::invalid("as_strided", "shape and strides must have the same length"));
    }
    let size: usize = shape.iter().product();
    let mut flat = Vec::with_capacity(size);
    if size > 0 {
        let mut index = vec![0usize; shape.len()];
        loop {
            let pos = offset as i64 + index.iter().zip(st).map(|(&i, &s)| i as i64 * s).sum::<i64>();
            if pos < 0 || pos as usize >= a.size() {
                return Err(EngineError::invalid(
                    "as_strided",
                    format!("position {} is outside an array of size {}", pos, a.size()),
                ));
            }
            flat.push(pos as usize);
            if !increment(&mut index, shape) {
                break;
            }
        }
    }
    Ok(a.gather(shape.to_vec(), &flat))
}

/// Reinterpret the element bytes as another dtype; the last axis is rescaled
pub fn view(a: &Tensor, dtype: Dtype) -> EngineResult<Tensor> {
    let (from, to) = (a.dtype.size(), dtype.size());
    let mut shape = a.shape.clone();
    if from != to {
        let last = shape
            .last_mut()
            .ok_or_else(|| EngineError::invalid("view", "cannot change the item size of a scalar"))?;
        if (*last * from) % to != 0 {
            return Err(EngineError::invalid(
                "view",
                format!("last axis of {} bytes is not divisible by the item size {}", *last * from, to),
            ));
        }
        *last = *last * from / to;
    }
    from_bytes("view", &to_bytes(a), shape, dtype)
}

// ============================================================================
// Matmul
// ============================================================================

fn batched<T>(a: &[T], b: &[T], a_shape: &[usize], b_shape: &[usize], out_batch: &[usize], m: usize, k: usize, n: usize) -> EngineResult<Vec<T>>
where
    T: Copy + Default + Add<Output = T> + Mul<Output = T>,
{
    let a_batch = &a_shape[..a_shape.len() - 2];
    let b_batch = &b_shape[..b_shape.len() - 2];
    let amap = broadcast_map("matmul", a_batch, out_batch)?;
    let bmap = broadcast_map("matmul", b_batch, out_batch)?;
    let mut out = Vec::with_capacity(amap.len() * m * n);
    for (&ia, &ib) in amap.iter().zip(&bmap) {
        let (ao, bo) = (ia * m * k, ib * k * n);
        for i in 0..m {
            for j in 0..n {
                let mut acc = T::default();
                for p in 0..k {
                    acc = acc + a[ao + i * k + p] * b[bo + p * n + j];
                }
                out.push(acc);
            }
        }
    }
    Ok(out)
}

pub fn matmul(a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
    if a.ndim() == 0 || b.ndim() == 0 {
        return Err(EngineError::invalid("matmul", "inputs must have at least one dimension"));
    }
    let mut a_shape = a.shape.clone();
    let mut b_shape = b.shape.clone();
    if a.ndim() == 1 {
        a_shape.insert(0, 1);
    }
    if b.ndim() == 1 {
        b_shape.push(1);
    }
    let (m, k) = (a_shape[a_shape.len() - 2], a_shape[a_shape.len() - 1]);
    let (k2, n) = (b_shape[b_shape.len() - 2], b_shape[b_shape.len() - 1]);
    if k != k2 {
        return Err(EngineError::invalid(
            "matmul",
            format!("last dimension of first input {:?} must match second to last of second input {:?}", a.shape, b.shape),
        ));
    }
    let out_batch = broadcast_shapes("matmul", &a_shape[..a_shape.len() - 2], &b_shape[..b_shape.len() - 2])?;
    let dtype = promote_types(a.dtype, b.dtype);
    let mut shape = out_batch.clone();
    if a.ndim() > 1 {
        shape.push(m);
    }
    if b.ndim() > 1 {
        shape.push(n);
    }
    if dtype.is_complex() {
        let out = batched(&a.complex_values(), &b.complex_values(), &a_shape, &b_shape, &out_batch, m, k, n)?;
        return Ok(Tensor::complex(shape, out));
    }
    let out = batched(&a.values(), &b.values(), &a_shape, &b_shape, &out_batch, m, k, n)?;
    Ok(Tensor::real(shape, dtype, out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn arange(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::real(shape.to_vec(), Dtype::Float32, (0..n).map(|i| i as f64).collect())
    }

    #[test]
    fn test_transpose() {
        let t = transpose(&arange(&[2, 3]), &[1, 0]).unwrap();
        assert_eq!(t.shape, vec![3, 2]);
        assert_eq!(t.values().to_vec(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(transpose(&arange(&[2, 3]), &[0, 0]).is_err());
    }

    #[test]
    fn test_negative_step_slice() {
        let s = slice(&arange(&[5]), &[4], &[-1], &[-2]).unwrap();
        assert_eq!(s.values().to_vec(), vec![4.0, 2.0, 0.0]);
        let s = slice(&arange(&[2, 3]), &[0, 1], &[2, 3], &[1, 1]).unwrap();
        assert_eq!(s.shape, vec![2, 2]);
        assert_eq!(s.values().to_vec(), vec![1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn test_slice_update_broadcasts() {
        let out = slice_update(&arange(&[4]), &Tensor::scalar(9.0, Dtype::Float32), &[1], &[3], &[1]).unwrap();
        assert_eq!(out.values().to_vec(), vec![0.0, 9.0, 9.0, 3.0]);
    }

    #[test]
    fn test_take_wraps_negative() {
        let idx = Tensor::real(vec![2], Dtype::Int32, vec![-1.0, 0.0]);
        let out = take(&arange(&[2, 3]), &idx, 1).unwrap();
        assert_eq!(out.values().to_vec(), vec![2.0, 0.0, 5.0, 3.0]);
        let bad = Tensor::real(vec![1], Dtype::Int32, vec![3.0]);
        assert!(take(&arange(&[3]), &bad, 0).is_err());
    }

    #[test]
    fn test_along_axis() {
        let idx = Tensor::real(vec![2, 1], Dtype::Int32, vec![2.0, 0.0]);
        let got = take_along_axis(&arange(&[2, 3]), &idx, 1).unwrap();
        assert_eq!(got.values().to_vec(), vec![2.0, 3.0]);
        let put = put_along_axis(&arange(&[2, 3]), &idx, &Tensor::scalar(-1.0, Dtype::Float32), 1).unwrap();
        assert_eq!(put.values().to_vec(), vec![0.0, 1.0, -1.0, -1.0, 4.0, 5.0]);
    }

    #[test]
    fn test_pad_modes() {
        let zero = Tensor::scalar(0.0, Dtype::Float32);
        let c = pad(&arange(&[2]), &[1], &[2], &zero, PadMode::Constant).unwrap();
        assert_eq!(c.values().to_vec(), vec![0.0, 0.0, 1.0, 0.0, 0.0]);
        let e = pad(&arange(&[2]), &[1], &[1], &zero, PadMode::Edge).unwrap();
        assert_eq!(e.values().to_vec(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_matmul_shapes() {
        let out = matmul(&arange(&[2, 3]), &arange(&[3, 2])).unwrap();
        assert_eq!(out.values().to_vec(), vec![10.0, 13.0, 28.0, 40.0]);
        let v = matmul(&arange(&[3]), &arange(&[3, 2])).unwrap();
        assert_eq!(v.shape, vec![2]);
        let batch = matmul(&arange(&[4, 2, 3]), &arange(&[3, 5])).unwrap();
        assert_eq!(batch.shape, vec![4, 2, 5]);
        assert!(matmul(&arange(&[2, 3]), &arange(&[2, 3])).is_err());
    }

    #[test]
    fn test_view_rescales_last_axis() {
        let a = Tensor::real(vec![2], Dtype::Int32, vec![1.0, 2.0]);
        let v = view(&a, Dtype::Int16).unwrap();
        assert_eq!(v.shape, vec![4]);
        assert_eq!(v.values().to_vec(), vec![1.0, 0.0, 2.0, 0.0]);
    }
}
