//! Dense Linear Algebra
//!
//! Every factorization runs in double precision on one matrix at a time and
//! is mapped over the leading batch axes. Integer inputs produce float32;
//! complex inputs are rejected.
//!
//! ## Algorithms
//!
//! - inverse and solve: Gauss-Jordan and LU with partial pivoting
//! - QR: Householder reflections, reduced form
//! - SVD: one-sided Jacobi, with the left basis completed by Gram-Schmidt
//! - symmetric eigensystems: cyclic Jacobi rotations, ascending order
//!
//! General (non-symmetric) eigenproblems are not provided.

use std::ops::{Index, IndexMut};

use mlx_engine::ops::broadcast_shapes;
use mlx_engine::{promote_types, Dtype, EngineError, EngineResult, LinalgOp};

use crate::tensor::{broadcast_map, Tensor, C64};

const BACKEND: &str = "cpu";
const MAX_SWEEPS: usize = 100;

// ============================================================================
// Matrix
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Mat {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Index<(usize, usize)> for Mat {
    type Output = f64;

    fn index(&self, (i, j): (usize, usize)) -> &f64 {
        &self.data[i * self.cols + j]
    }
}

impl IndexMut<(usize, usize)> for Mat {
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f64 {
        &mut self.data[i * self.cols + j]
    }
}

impl Mat {
    fn zeros(rows: usize, cols: usize) -> Mat {
        Mat {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    fn identity(n: usize) -> Mat {
        let mut m = Mat::zeros(n, n);
        for i in 0..n {
            m[(i, i)] = 1.0;
        }
        m
    }

    fn transpose(&self) -> Mat {
        let mut t = Mat::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                t[(j, i)] = self[(i, j)];
            }
        }
        t
    }

    fn matmul(&self, other: &Mat) -> Mat {
        let mut out = Mat::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for p in 0..self.cols {
                let x = self[(i, p)];
                for j in 0..other.cols {
                    out[(i, j)] += x * other[(p, j)];
                }
            }
        }
        out
    }

    /// Leading `rows x cols` block
    fn block(&self, rows: usize, cols: usize) -> Mat {
        let mut out = Mat::zeros(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                out[(i, j)] = self[(i, j)];
            }
        }
        out
    }

    fn max_abs(&self) -> f64 {
        self.data.iter().fold(0.0, |m, x| m.max(x.abs()))
    }

    fn is_symmetric(&self) -> bool {
        let tol = 1e-9 * self.max_abs().max(1.0);
        (0..self.rows).all(|i| (0..i).all(|j| (self[(i, j)] - self[(j, i)]).abs() <= tol))
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a != b {
            for j in 0..self.cols {
                self.data.swap(a * self.cols + j, b * self.cols + j);
            }
        }
    }
}

// ============================================================================
// Batching
// ============================================================================

fn out_dtype(dtype: Dtype) -> Dtype {
    if dtype.is_floating() {
        dtype
    } else {
        Dtype::Float32
    }
}

/// Split into batch shape and matrices
fn split(op: LinalgOp, t: &Tensor) -> EngineResult<(Vec<usize>, Vec<Mat>)> {
    if t.dtype.is_complex() {
        return Err(EngineError::dtype(op.name(), t.dtype));
    }
    if t.ndim() < 2 {
        return Err(EngineError::invalid(
            op.name(),
            format!("input must have at least 2 dimensions, got {}", t.ndim()),
        ));
    }
    let (rows, cols) = (t.shape[t.ndim() - 2], t.shape[t.ndim() - 1]);
    let batch = t.shape[..t.ndim() - 2].to_vec();
    let values = t.values();
    let mats = if rows * cols == 0 {
        vec![Mat::zeros(rows, cols); batch.iter().product()]
    } else {
        values
            .chunks(rows * cols)
            .map(|c| Mat {
                rows,
                cols,
                data: c.to_vec(),
            })
            .collect()
    };
    Ok((batch, mats))
}

fn split_square(op: LinalgOp, t: &Tensor) -> EngineResult<(Vec<usize>, Vec<Mat>)> {
    let (batch, mats) = split(op, t)?;
    let (rows, cols) = (t.shape[t.ndim() - 2], t.shape[t.ndim() - 1]);
    if rows != cols {
        return Err(EngineError::invalid(
            op.name(),
            format!("input must be a square matrix, got shape {:?}", t.shape),
        ));
    }
    Ok((batch, mats))
}

fn join(batch: &[usize], rows: usize, cols: usize, mats: Vec<Mat>, dtype: Dtype) -> Tensor {
    let mut shape = batch.to_vec();
    shape.extend([rows, cols]);
    Tensor::real(shape, dtype, mats.into_iter().flat_map(|m| m.data).collect())
}

fn join_vec(batch: &[usize], len: usize, vecs: Vec<Vec<f64>>, dtype: Dtype) -> Tensor {
    let mut shape = batch.to_vec();
    shape.push(len);
    Tensor::real(shape, dtype, vecs.into_iter().flatten().collect())
}

fn singular(op: LinalgOp) -> EngineError {
    EngineError::invalid(op.name(), "matrix is singular")
}

// ============================================================================
// Kernels
// ============================================================================

/// Gauss-Jordan inverse with partial pivoting
fn inverse(op: LinalgOp, a: &Mat) -> EngineResult<Mat> {
    let n = a.rows;
    let mut m = a.clone();
    let mut inv = Mat::identity(n);
    let tol = f64::EPSILON * a.max_abs() * n as f64;
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&x, &y| m[(x, col)].abs().total_cmp(&m[(y, col)].abs()))
            .unwrap_or(col);
        if m[(pivot, col)].abs() <= tol {
            return Err(singular(op));
        }
        m.swap_rows(col, pivot);
        inv.swap_rows(col, pivot);
        let p = m[(col, col)];
        for j in 0..n {
            m[(col, j)] /= p;
            inv[(col, j)] /= p;
        }
        for r in 0..n {
            if r == col {
                continue;
            }
            let f = m[(r, col)];
            if f != 0.0 {
                for j in 0..n {
                    m[(r, j)] -= f * m[(col, j)];
                    inv[(r, j)] -= f * inv[(col, j)];
                }
            }
        }
    }
    Ok(inv)
}

fn mask_triangle(a: &Mat, upper: bool) -> Mat {
    let mut out = a.clone();
    for i in 0..a.rows {
        for j in 0..a.cols {
            if (upper && j < i) || (!upper && j > i) {
                out[(i, j)] = 0.0;
            }
        }
    }
    out
}

/// Lower Cholesky factor
fn cholesky(op: LinalgOp, a: &Mat) -> EngineResult<Mat> {
    let n = a.rows;
    let mut l = Mat::zeros(n, n);
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[(i, j)];
            for k in 0..j {
                sum -= l[(i, k)] * l[(j, k)];
            }
            if i == j {
                if sum <= 0.0 {
                    return Err(EngineError::invalid(op.name(), "matrix is not positive definite"));
                }
                l[(i, i)] = sum.sqrt();
            } else {
                l[(i, j)] = sum / l[(j, j)];
            }
        }
    }
    Ok(l)
}

/// Partial-pivot LU of an `m x n` matrix: the packed factors and the row
/// swapped in at each step
fn lu_packed(a: &Mat) -> (Mat, Vec<usize>) {
    let (m, n) = (a.rows, a.cols);
    let k = m.min(n);
    let mut lu = a.clone();
    let mut pivots = Vec::with_capacity(k);
    for j in 0..k {
        let p = (j..m)
            .max_by(|&x, &y| lu[(x, j)].abs().total_cmp(&lu[(y, j)].abs()))
            .unwrap_or(j);
        pivots.push(p);
        lu.swap_rows(j, p);
        let d = lu[(j, j)];
        if d == 0.0 {
            continue;
        }
        for i in j + 1..m {
            let f = lu[(i, j)] / d;
            lu[(i, j)] = f;
            for c in j + 1..n {
                lu[(i, c)] -= f * lu[(j, c)];
            }
        }
    }
    (lu, pivots)
}

/// Row order after applying the recorded swaps
fn permutation(m: usize, pivots: &[usize]) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..m).collect();
    for (j, &p) in pivots.iter().enumerate() {
        perm.swap(j, p);
    }
    perm
}

/// Solve `a x = b` for every column of `b`
fn lu_solve(op: LinalgOp, a: &Mat, b: &Mat) -> EngineResult<Mat> {
    let n = a.rows;
    let (lu, pivots) = lu_packed(a);
    let tol = f64::EPSILON * a.max_abs() * n as f64;
    if (0..n).any(|i| lu[(i, i)].abs() <= tol) {
        return Err(singular(op));
    }
    let perm = permutation(n, &pivots);
    let mut x = Mat::zeros(n, b.cols);
    for c in 0..b.cols {
        let mut y: Vec<f64> = perm.iter().map(|&r| b[(r, c)]).collect();
        for i in 0..n {
            for k in 0..i {
                y[i] -= lu[(i, k)] * y[k];
            }
        }
        for i in (0..n).rev() {
            for k in i + 1..n {
                y[i] -= lu[(i, k)] * y[k];
            }
            y[i] /= lu[(i, i)];
        }
        for i in 0..n {
            x[(i, c)] = y[i];
        }
    }
    Ok(x)
}

fn triangular_solve(op: LinalgOp, a: &Mat, b: &Mat, upper: bool) -> EngineResult<Mat> {
    let n = a.rows;
    if (0..n).any(|i| a[(i, i)] == 0.0) {
        return Err(singular(op));
    }
    let mut x = Mat::zeros(n, b.cols);
    for c in 0..b.cols {
        let order: Vec<usize> = if upper { (0..n).rev().collect() } else { (0..n).collect() };
        for &i in &order {
            let mut sum = b[(i, c)];
            for k in 0..n {
                let known = if upper { k > i } else { k < i };
                if known {
                    sum -= a[(i, k)] * x[(k, c)];
                }
            }
            x[(i, c)] = sum / a[(i, i)];
        }
    }
    Ok(x)
}

/// Reduced Householder QR
fn qr(a: &Mat) -> (Mat, Mat) {
    let (m, n) = (a.rows, a.cols);
    let k = m.min(n);
    let mut r = a.clone();
    let mut q = Mat::identity(m);
    for j in 0..k {
        let norm = (j..m).map(|i| r[(i, j)] * r[(i, j)]).sum::<f64>().sqrt();
        if norm == 0.0 {
            continue;
        }
        let alpha = if r[(j, j)] > 0.0 { -norm } else { norm };
        let mut v: Vec<f64> = (j..m).map(|i| r[(i, j)]).collect();
        v[0] -= alpha;
        let vv: f64 = v.iter().map(|x| x * x).sum();
        if vv == 0.0 {
            continue;
        }
        for c in 0..n {
            let dot: f64 = (j..m).map(|i| v[i - j] * r[(i, c)]).sum();
            let f = 2.0 * dot / vv;
            for i in j..m {
                r[(i, c)] -= f * v[i - j];
            }
        }
        for row in 0..m {
            let dot: f64 = (j..m).map(|i| q[(row, i)] * v[i - j]).sum();
            let f = 2.0 * dot / vv;
            for i in j..m {
                q[(row, i)] -= f * v[i - j];
            }
        }
    }
    let mut r = r.block(k, n);
    for i in 0..k {
        for j in 0..i.min(n) {
            r[(i, j)] = 0.0;
        }
    }
    (q.block(m, k), r)
}

/// Full SVD: `U` is `m x m`, singular values descending, `Vt` is `n x n`
fn svd(a: &Mat) -> (Mat, Vec<f64>, Mat) {
    if a.rows < a.cols {
        let (u, s, vt) = svd(&a.transpose());
        return (vt.transpose(), s, u.transpose());
    }
    let (m, n) = (a.rows, a.cols);
    let mut u = a.clone();
    let mut v = Mat::identity(n);
    for _ in 0..MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n {
            for q in p + 1..n {
                let (mut alpha, mut beta, mut gamma) = (0.0, 0.0, 0.0);
                for i in 0..m {
                    alpha += u[(i, p)] * u[(i, p)];
                    beta += u[(i, q)] * u[(i, q)];
                    gamma += u[(i, p)] * u[(i, q)];
                }
                if gamma.abs() <= 1e-15 * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                for mat in [&mut u, &mut v] {
                    for i in 0..mat.rows {
                        let (xp, xq) = (mat[(i, p)], mat[(i, q)]);
                        mat[(i, p)] = c * xp - s * xq;
                        mat[(i, q)] = s * xp + c * xq;
                    }
                }
            }
        }
        if !rotated {
            break;
        }
    }
    let norms: Vec<f64> = (0..n)
        .map(|j| (0..m).map(|i| u[(i, j)] * u[(i, j)]).sum::<f64>().sqrt())
        .collect();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| norms[y].total_cmp(&norms[x]));
    let tiny = f64::EPSILON * norms.iter().fold(0.0f64, |a, &b| a.max(b)).max(f64::MIN_POSITIVE);

    let mut vt = Mat::zeros(n, n);
    let mut s = Vec::with_capacity(n);
    let mut basis: Vec<Option<Vec<f64>>> = vec![None; m];
    for (row, &j) in order.iter().enumerate() {
        s.push(norms[j]);
        for i in 0..n {
            vt[(row, i)] = v[(i, j)];
        }
        if norms[j] > tiny {
            basis[row] = Some((0..m).map(|i| u[(i, j)] / norms[j]).collect());
        }
    }
    // complete the left basis from the standard basis
    let mut candidate = 0;
    for col in 0..m {
        if basis[col].is_some() {
            continue;
        }
        while candidate < m {
            let mut w = vec![0.0; m];
            w[candidate] = 1.0;
            candidate += 1;
            for b in basis.iter().flatten() {
                let dot: f64 = b.iter().zip(&w).map(|(x, y)| x * y).sum();
                for (wi, bi) in w.iter_mut().zip(b) {
                    *wi -= dot * bi;
                }
            }
            let norm = w.iter().map(|x| x * x).sum::<f64>().sqrt();
            if norm > 1e-8 {
                basis[col] = Some(w.iter().map(|x| x / norm).collect());
                break;
            }
        }
    }
    let mut um = Mat::zeros(m, m);
    for (j, b) in basis.iter().enumerate() {
        if let Some(b) = b {
            for i in 0..m {
                um[(i, j)] = b[i];
            }
        }
    }
    (um, s, vt)
}

/// Symmetric eigensystem from one triangle: ascending values, vectors as columns
fn eigh(a: &Mat, upper: bool) -> (Vec<f64>, Mat) {
    let n = a.rows;
    let mut m = a.clone();
    for i in 0..n {
        for j in 0..i {
            let x = if upper { a[(j, i)] } else { a[(i, j)] };
            m[(i, j)] = x;
            m[(j, i)] = x;
        }
    }
    let mut v = Mat::identity(n);
    for _ in 0..MAX_SWEEPS {
        let mut off = 0.0;
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    off += m[(i, j)] * m[(i, j)];
                }
            }
        }
        if off <= 1e-30 * m.max_abs().max(f64::MIN_POSITIVE).powi(2) {
            break;
        }
        for p in 0..n {
            for q in p + 1..n {
                if m[(p, q)] == 0.0 {
                    continue;
                }
                let theta = (m[(q, q)] - m[(p, p)]) / (2.0 * m[(p, q)]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let (kp, kq) = (m[(k, p)], m[(k, q)]);
                    m[(k, p)] = c * kp - s * kq;
                    m[(k, q)] = s * kp + c * kq;
                }
                for k in 0..n {
                    let (pk, qk) = (m[(p, k)], m[(q, k)]);
                    m[(p, k)] = c * pk - s * qk;
                    m[(q, k)] = s * pk + c * qk;
                }
                for k in 0..n {
                    let (kp, kq) = (v[(k, p)], v[(k, q)]);
                    v[(k, p)] = c * kp - s * kq;
                    v[(k, q)] = s * kp + c * kq;
                }
            }
        }
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| m[(x, x)].total_cmp(&m[(y, y)]));
    let values = order.iter().map(|&i| m[(i, i)]).collect();
    let mut vectors = Mat::zeros(n, n);
    for (col, &j) in order.iter().enumerate() {
        for i in 0..n {
            vectors[(i, col)] = v[(i, j)];
        }
    }
    (values, vectors)
}

fn pinv(a: &Mat) -> Mat {
    let (u, s, vt) = svd(a);
    let (m, n) = (a.rows, a.cols);
    let smax = s.first().copied().unwrap_or(0.0);
    let cutoff = f64::EPSILON * m.max(n) as f64 * smax;
    let mut out = Mat::zeros(n, m);
    for (k, &sk) in s.iter().enumerate() {
        if sk <= cutoff {
            continue;
        }
        for i in 0..n {
            for j in 0..m {
                out[(i, j)] += vt[(k, i)] * u[(j, k)] / sk;
            }
        }
    }
    out
}

// ============================================================================
// Entry point
// ============================================================================

/// Solve-style ops: `b` is a batch of vectors when it has one axis fewer than `a`
fn solve_batched(op: LinalgOp, a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
    let (a_batch, a_mats) = split_square(op, a)?;
    if b.dtype.is_complex() {
        return Err(EngineError::dtype(op.name(), b.dtype));
    }
    let n = a.shape[a.ndim() - 1];
    let vector = b.ndim() + 1 == a.ndim() || b.ndim() == 1;
    let (b_batch, k) = if vector {
        (b.shape[..b.ndim().saturating_sub(1)].to_vec(), 1)
    } else if b.ndim() >= 2 {
        (b.shape[..b.ndim() - 2].to_vec(), b.shape[b.ndim() - 1])
    } else {
        return Err(EngineError::invalid(op.name(), "right-hand side must have at least 1 dimension"));
    };
    let rows = if vector { b.shape.last().copied().unwrap_or(0) } else { b.shape[b.ndim() - 2] };
    if rows != n {
        return Err(EngineError::invalid(
            op.name(),
            format!("shapes {:?} and {:?} are incompatible", a.shape, b.shape),
        ));
    }
    let batch = broadcast_shapes(op.name(), &a_batch, &b_batch)?;
    let amap = broadcast_map(op.name(), &a_batch, &batch)?;
    let bmap = broadcast_map(op.name(), &b_batch, &batch)?;
    let bv = b.values();
    let mut out = Vec::with_capacity(amap.len() * n * k);
    for (&ia, &ib) in amap.iter().zip(&bmap) {
        let data: Vec<f64> = bv[ib * n * k..(ib + 1) * n * k].to_vec();
        let rhs = Mat { rows: n, cols: k, data };
        let x = match op {
            LinalgOp::SolveTriangular { upper } => triangular_solve(op, &a_mats[ia], &rhs, upper)?,
            _ => lu_solve(op, &a_mats[ia], &rhs)?,
        };
        out.extend(x.data);
    }
    let mut shape = batch;
    shape.push(n);
    if !vector {
        shape.push(k);
    }
    Ok(Tensor::real(shape, out_dtype(promote_types(a.dtype, b.dtype)), out))
}

/// Evaluate a factorization or solve
pub fn linalg(op: LinalgOp, inputs: &[&Tensor]) -> EngineResult<Vec<Tensor>> {
    if inputs.len() != op.input_count() {
        return Err(EngineError::invalid(
            op.name(),
            format!("expected {} inputs, got {}", op.input_count(), inputs.len()),
        ));
    }
    let a = inputs[0];
    let dtype = out_dtype(a.dtype);
    let dims = |t: &Tensor| (t.shape[t.ndim() - 2], t.shape[t.ndim() - 1]);
    match op {
        LinalgOp::Inv | LinalgOp::TriInv { .. } | LinalgOp::CholeskyInv { .. } => {
            let (batch, mats) = split_square(op, a)?;
            let n = a.shape[a.ndim() - 1];
            let inverted = mats
                .iter()
                .map(|m| match op {
                    LinalgOp::TriInv { upper } => inverse(op, &mask_triangle(m, upper)),
                    LinalgOp::CholeskyInv { upper } => {
                        let f = mask_triangle(m, upper);
                        let full = if upper { f.transpose().matmul(&f) } else { f.matmul(&f.transpose()) };
                        inverse(op, &full)
                    }
                    _ => inverse(op, m),
                })
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(vec![join(&batch, n, n, inverted, dtype)])
        }
        LinalgOp::Cholesky { upper } => {
            let (batch, mats) = split_square(op, a)?;
            let n = a.shape[a.ndim() - 1];
            let factors = mats
                .iter()
                .map(|m| cholesky(op, m).map(|l| if upper { l.transpose() } else { l }))
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(vec![join(&batch, n, n, factors, dtype)])
        }
        LinalgOp::Pinv => {
            let (batch, mats) = split(op, a)?;
            let (m, n) = dims(a);
            Ok(vec![join(&batch, n, m, mats.iter().map(pinv).collect(), dtype)])
        }
        LinalgOp::Qr => {
            let (batch, mats) = split(op, a)?;
            let (m, n) = dims(a);
            let k = m.min(n);
            let (qs, rs): (Vec<_>, Vec<_>) = mats.iter().map(qr).unzip();
            Ok(vec![join(&batch, m, k, qs, dtype), join(&batch, k, n, rs, dtype)])
        }
        LinalgOp::Svd { compute_uv } => {
            let (batch, mats) = split(op, a)?;
            let (m, n) = dims(a);
            let k = m.min(n);
            let mut us = Vec::with_capacity(mats.len());
            let mut ss = Vec::with_capacity(mats.len());
            let mut vts = Vec::with_capacity(mats.len());
            for mat in &mats {
                let (u, mut s, vt) = svd(mat);
                s.truncate(k);
                us.push(u);
                ss.push(s);
                vts.push(vt);
            }
            let s = join_vec(&batch, k, ss, dtype);
            if compute_uv {
                Ok(vec![join(&batch, m, m, us, dtype), s, join(&batch, n, n, vts, dtype)])
            } else {
                Ok(vec![s])
            }
        }
        LinalgOp::Lu | LinalgOp::LuFactor => {
            let (batch, mats) = split(op, a)?;
            let (m, n) = dims(a);
            let k = m.min(n);
            let mut perms = Vec::with_capacity(mats.len());
            let mut ls = Vec::with_capacity(mats.len());
            let mut uppers = Vec::with_capacity(mats.len());
            let mut packed = Vec::with_capacity(mats.len());
            for mat in &mats {
                let (lu, pivots) = lu_packed(mat);
                if op == LinalgOp::LuFactor {
                    perms.push(pivots.iter().map(|&p| p as f64).collect());
                    packed.push(lu);
                    continue;
                }
                // rows of A are rows of L @ U taken in this order
                let perm = permutation(m, &pivots);
                let mut inverse_perm = vec![0.0; m];
                for (i, &r) in perm.iter().enumerate() {
                    inverse_perm[r] = i as f64;
                }
                perms.push(inverse_perm);
                let mut l = Mat::zeros(m, k);
                let mut u = Mat::zeros(k, n);
                for i in 0..m {
                    for j in 0..k {
                        l[(i, j)] = match i.cmp(&j) {
                            std::cmp::Ordering::Greater => lu[(i, j)],
                            std::cmp::Ordering::Equal => 1.0,
                            std::cmp::Ordering::Less => 0.0,
                        };
                    }
                }
                for i in 0..k {
                    for j in i..n {
                        u[(i, j)] = lu[(i, j)];
                    }
                }
                ls.push(l);
                uppers.push(u);
            }
            if op == LinalgOp::LuFactor {
                return Ok(vec![join(&batch, m, n, packed, dtype), join_vec(&batch, k, perms, Dtype::Uint32)]);
            }
            Ok(vec![
                join_vec(&batch, m, perms, Dtype::Uint32),
                join(&batch, m, k, ls, dtype),
                join(&batch, k, n, uppers, dtype),
            ])
        }
        LinalgOp::Solve | LinalgOp::SolveTriangular { .. } => Ok(vec![solve_batched(op, a, inputs[1])?]),
        LinalgOp::Eigh { upper } | LinalgOp::EigvalsH { upper } => {
            let (batch, mats) = split_square(op, a)?;
            let n = a.shape[a.ndim() - 1];
            let (values, vectors): (Vec<_>, Vec<_>) = mats.iter().map(|m| eigh(m, upper)).unzip();
            let w = join_vec(&batch, n, values, dtype);
            if matches!(op, LinalgOp::Eigh { .. }) {
                Ok(vec![w, join(&batch, n, n, vectors, dtype)])
            } else {
                Ok(vec![w])
            }
        }
        LinalgOp::Eig | LinalgOp::EigVals => {
            let (batch, mats) = split_square(op, a)?;
            if !mats.iter().all(Mat::is_symmetric) {
                return Err(EngineError::unsupported(format!("{} of a non-symmetric matrix", op.name()), BACKEND));
            }
            let n = a.shape[a.ndim() - 1];
            let (values, vectors): (Vec<_>, Vec<_>) = mats.iter().map(|m| eigh(m, false)).unzip();
            let mut wshape = batch.clone();
            wshape.push(n);
            let w = Tensor::complex(wshape, values.into_iter().flatten().map(|x| C64::new(x, 0.0)).collect());
            if op == LinalgOp::EigVals {
                return Ok(vec![w]);
            }
            let mut vshape = batch;
            vshape.extend([n, n]);
            let v = Tensor::complex(vshape, vectors.into_iter().flat_map(|m| m.data).map(|x| C64::new(x, 0.0)).collect());
            Ok(vec![w, v])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn matrix(rows: usize, cols: usize, values: &[f64]) -> Tensor {
        Tensor::real(vec![rows, cols], Dtype::Float64, values.to_vec())
    }

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    fn product(a: &Tensor, b: &Tensor) -> Vec<f64> {
        crate::layout::matmul(a, b).unwrap().values().to_vec()
    }

    #[test]
    fn test_inverse() {
        let a = matrix(2, 2, &[4.0, 7.0, 2.0, 6.0]);
        let inv = &linalg(LinalgOp::Inv, &[&a]).unwrap()[0];
        assert!(close(&product(&a, inv), &[1.0, 0.0, 0.0, 1.0]));
        let s = matrix(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        assert!(linalg(LinalgOp::Inv, &[&s]).is_err());
    }

    #[test]
    fn test_integer_input_becomes_float32() {
        let a = Tensor::real(vec![2, 2], Dtype::Int32, vec![2.0, 0.0, 0.0, 4.0]);
        let inv = &linalg(LinalgOp::Inv, &[&a]).unwrap()[0];
        assert_eq!(inv.dtype, Dtype::Float32);
        assert_eq!(inv.values().to_vec(), vec![0.5, 0.0, 0.0, 0.25]);
    }

    #[test]
    fn test_cholesky() {
        let a = matrix(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let l = &linalg(LinalgOp::Cholesky { upper: false }, &[&a]).unwrap()[0];
        let lt = crate::layout::transpose(l, &[1, 0]).unwrap();
        assert!(close(&product(l, &lt), &[4.0, 2.0, 2.0, 3.0]));
        let bad = matrix(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(linalg(LinalgOp::Cholesky { upper: false }, &[&bad]).is_err());
    }

    #[test]
    fn test_qr_reconstructs() {
        let a = matrix(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = linalg(LinalgOp::Qr, &[&a]).unwrap();
        assert_eq!(out[0].shape, vec![3, 2]);
        assert_eq!(out[1].shape, vec![2, 2]);
        assert!(close(&product(&out[0], &out[1]), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));
    }

    #[test]
    fn test_svd_reconstructs() {
        let a = matrix(2, 3, &[3.0, 2.0, 2.0, 2.0, 3.0, -2.0]);
        let out = linalg(LinalgOp::Svd { compute_uv: true }, &[&a]).unwrap();
        assert_eq!(out[0].shape, vec![2, 2]);
        assert_eq!(out[2].shape, vec![3, 3]);
        let s = out[1].values().to_vec();
        assert!(close(&s, &[5.0, 3.0]));
        let mut sigma = vec![0.0; 6];
        sigma[0] = s[0];
        sigma[4] = s[1];
        let us = product(&out[0], &matrix(2, 3, &sigma));
        assert!(close(&product(&matrix(2, 3, &us), &out[2]), &[3.0, 2.0, 2.0, 2.0, 3.0, -2.0]));
    }

    #[test]
    fn test_lu_permutation_vector() {
        let a = matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let out = linalg(LinalgOp::Lu, &[&a]).unwrap();
        assert_eq!(out[0].shape, vec![2]);
        assert_eq!(out[0].dtype, Dtype::Uint32);
        let lu = product(&out[1], &out[2]);
        let p = out[0].values();
        // row i of A is row p[i] of L @ U
        for i in 0..2 {
            let r = p[i] as usize;
            assert!(close(&lu[r * 2..r * 2 + 2], &a.values()[i * 2..i * 2 + 2]));
        }
    }

    #[test]
    fn test_solve_vector_and_triangular() {
        let a = matrix(2, 2, &[3.0, 1.0, 1.0, 2.0]);
        let b = Tensor::real(vec![2], Dtype::Float64, vec![9.0, 8.0]);
        let x = &linalg(LinalgOp::Solve, &[&a, &b]).unwrap()[0];
        assert_eq!(x.shape, vec![2]);
        assert!(close(&x.values(), &[2.0, 3.0]));

        let u = matrix(2, 2, &[2.0, 1.0, 0.0, 4.0]);
        let x = &linalg(LinalgOp::SolveTriangular { upper: true }, &[&u, &b]).unwrap()[0];
        assert!(close(&x.values(), &[3.5, 2.0]));
    }

    #[test]
    fn test_eigh_ascending() {
        let a = matrix(2, 2, &[2.0, 1.0, 1.0, 2.0]);
        let out = linalg(LinalgOp::Eigh { upper: false }, &[&a]).unwrap();
        assert!(close(&out[0].values(), &[1.0, 3.0]));
        let eig = linalg(LinalgOp::EigVals, &[&a]).unwrap();
        assert_eq!(eig[0].dtype, Dtype::Complex64);
        let skew = matrix(2, 2, &[0.0, 1.0, -1.0, 0.0]);
        assert!(linalg(LinalgOp::Eig, &[&skew]).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_pinv_of_rank_deficient() {
        let a = matrix(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let p = &linalg(LinalgOp::Pinv, &[&a]).unwrap()[0];
        assert!(close(&p.values(), &[0.25, 0.25, 0.25, 0.25]));
    }
}
