//! Elementwise kernels: unary, binary and select.

use mlx_engine::ops::float_dtype;
use mlx_engine::{promote_types, BinaryOp, Dtype, EngineError, EngineResult, UnaryOp};

use crate::special::{erf, erfinv, from_e4m3, round_half_even, to_e4m3};
use crate::tensor::{broadcast_map, Data, Tensor, C64};

// ============================================================================
// Unary
// ============================================================================

fn unary_dtype(op: UnaryOp, dt: Dtype) -> EngineResult<Dtype> {
    use UnaryOp::*;
    match op {
        Abs | Negative | Sign | Square | Floor | Ceil | Round(_) | StopGradient | Conjugate => Ok(dt),
        LogicalNot | IsNan | IsInf | IsPosInf | IsNegInf | IsFinite => Ok(Dtype::Bool),
        BitwiseInvert if dt.is_integer() || dt.is_bool() => Ok(dt),
        BitwiseInvert => Err(EngineError::dtype(op.name(), dt)),
        Real | Imag if dt.is_complex() => Ok(Dtype::Float32),
        Real | Imag => Ok(dt),
        ToFp8 => Ok(Dtype::Uint8),
        FromFp8 if dt == Dtype::Uint8 => Ok(Dtype::Float32),
        FromFp8 => Err(EngineError::dtype(op.name(), dt)),
        _ => Ok(float_dtype(dt)),
    }
}

fn real_unary(op: UnaryOp, dt: Dtype, x: f64) -> f64 {
    use UnaryOp::*;
    let b = |v: bool| f64::from(u8::from(v));
    match op {
        Abs => x.abs(),
        Negative => -x,
        Sign => {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                x
            }
        }
        Sqrt => x.sqrt(),
        Rsqrt => 1.0 / x.sqrt(),
        Square => x * x,
        Reciprocal => 1.0 / x,
        Exp => x.exp(),
        Expm1 => x.exp_m1(),
        Log => x.ln(),
        Log2 => x.log2(),
        Log10 => x.log10(),
        Log1p => x.ln_1p(),
        Sin => x.sin(),
        Cos => x.cos(),
        Tan => x.tan(),
        ArcSin => x.asin(),
        ArcCos => x.acos(),
        ArcTan => x.atan(),
        Sinh => x.sinh(),
        Cosh => x.cosh(),
        Tanh => x.tanh(),
        ArcSinh => x.asinh(),
        ArcCosh => x.acosh(),
        ArcTanh => x.atanh(),
        Sigmoid => 1.0 / (1.0 + (-x).exp()),
        Erf => erf(x),
        ErfInv => erfinv(x),
        Floor => x.floor(),
        Ceil => x.ceil(),
        Round(decimals) => {
            if dt.is_integer() || dt.is_bool() {
                x
            } else {
                round_half_even(x, decimals)
            }
        }
        LogicalNot => b(x == 0.0),
        BitwiseInvert => match dt.int_bits() {
            _ if dt.is_bool() => b(x == 0.0),
            Some(bits) if dt.is_unsigned() => 2f64.powi(bits as i32) - 1.0 - x,
            _ => -x - 1.0,
        },
        IsNan => b(x.is_nan()),
        IsInf => b(x.is_infinite()),
        IsPosInf => b(x == f64::INFINITY),
        IsNegInf => b(x == f64::NEG_INFINITY),
        IsFinite => b(x.is_finite()),
        StopGradient | Conjugate | Real => x,
        Imag => 0.0,
        ToFp8 => f64::from(to_e4m3(x)),
        FromFp8 => from_e4m3(x as u8),
    }
}

enum ComplexOut {
    Complex(C64),
    Real(f64),
}

fn complex_unary(op: UnaryOp, c: C64) -> Option<ComplexOut> {
    use ComplexOut::{Complex, Real};
    use UnaryOp::*;
    let b = |v: bool| Real(f64::from(u8::from(v)));
    Some(match op {
        Abs => Real(c.norm()),
        Negative => Complex(-c),
        Sign => Complex(if c.norm() == 0.0 { c } else { c / c.norm() }),
        Sqrt => Complex(c.sqrt()),
        Rsqrt => Complex(c.sqrt().inv()),
        Square => Complex(c * c),
        Reciprocal => Complex(c.inv()),
        Exp => Complex(c.exp()),
        Log => Complex(c.ln()),
        Log2 => Complex(c.ln() / std::f64::consts::LN_2),
        Log10 => Complex(c.ln() / std::f64::consts::LN_10),
        Sin => Complex(c.sin()),
        Cos => Complex(c.cos()),
        Tan => Complex(c.tan()),
        Sinh => Complex(c.sinh()),
        Cosh => Complex(c.cosh()),
        Tanh => Complex(c.tanh()),
        Conjugate => Complex(c.conj()),
        StopGradient => Complex(c),
        UnaryOp::Real => ComplexOut::Real(c.re),
        Imag => Real(c.im),
        IsNan => b(c.re.is_nan() || c.im.is_nan()),
        IsInf => b(c.re.is_infinite() || c.im.is_infinite()),
        IsFinite => b(c.re.is_finite() && c.im.is_finite()),
        _ => return None,
    })
}

pub fn unary(op: UnaryOp, a: &Tensor) -> EngineResult<Tensor> {
    match &a.data {
        Data::Real(values) => {
            let out = unary_dtype(op, a.dtype)?;
            let values = values.iter().map(|&x| real_unary(op, a.dtype, x)).collect();
            Ok(Tensor::real(a.shape.clone(), out, values))
        }
        Data::Complex(values) => {
            let mut real = Vec::new();
            let mut complex = Vec::new();
            for &c in values {
                match complex_unary(op, c) {
                    Some(ComplexOut::Real(x)) => real.push(x),
                    Some(ComplexOut::Complex(z)) => complex.push(z),
                    None => return Err(EngineError::dtype(op.name(), a.dtype)),
                }
            }
            match op {
                UnaryOp::IsNan | UnaryOp::IsInf | UnaryOp::IsFinite => Ok(Tensor::real(a.shape.clone(), Dtype::Bool, real)),
                UnaryOp::Abs | UnaryOp::Real | UnaryOp::Imag => Ok(Tensor::real(a.shape.clone(), Dtype::Float32, real)),
                _ => Ok(Tensor::complex(a.shape.clone(), complex)),
            }
        }
    }
}

// ============================================================================
// Binary
// ============================================================================

fn binary_dtype(op: BinaryOp, a: Dtype, b: Dtype) -> EngineResult<Dtype> {
    let p = promote_types(a, b);
    if op.is_comparison() {
        return Ok(Dtype::Bool);
    }
    match op {
        BinaryOp::Divide | BinaryOp::ArcTan2 | BinaryOp::LogAddExp => Ok(float_dtype(p)),
        _ if op.is_bitwise() && !(p.is_integer() || p.is_bool()) => Err(EngineError::dtype(op.name(), p)),
        _ => Ok(p),
    }
}

fn real_binary(op: BinaryOp, integral: bool, a: f64, b: f64) -> f64 {
    use BinaryOp::*;
    let t = |v: bool| f64::from(u8::from(v));
    match op {
        Add => a + b,
        Subtract => a - b,
        Multiply => a * b,
        Divide => a / b,
        FloorDivide if integral && b == 0.0 => 0.0,
        FloorDivide => (a / b).floor(),
        Remainder if integral && b == 0.0 => 0.0,
        Remainder => {
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        Power => a.powf(b),
        Maximum => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else {
                a.max(b)
            }
        }
        Minimum => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else {
                a.min(b)
            }
        }
        Equal => t(a == b),
        NotEqual => t(a != b),
        Less => t(a < b),
        LessEqual => t(a <= b),
        Greater => t(a > b),
        GreaterEqual => t(a >= b),
        LogicalAnd => t(a != 0.0 && b != 0.0),
        LogicalOr => t(a != 0.0 || b != 0.0),
        BitwiseAnd => ((a as i128) & (b as i128)) as f64,
        BitwiseOr => ((a as i128) | (b as i128)) as f64,
        BitwiseXor => ((a as i128) ^ (b as i128)) as f64,
        LeftShift => (a as i128).wrapping_shl(b.clamp(0.0, 127.0) as u32) as f64,
        RightShift => (a as i128).wrapping_shr(b.clamp(0.0, 127.0) as u32) as f64,
        ArcTan2 => a.atan2(b),
        LogAddExp => {
            let m = a.max(b);
            if m == f64::NEG_INFINITY {
                m
            } else {
                m + ((a - m).exp() + (b - m).exp()).ln()
            }
        }
    }
}

fn complex_binary(op: BinaryOp, a: C64, b: C64) -> Option<C64> {
    use BinaryOp::*;
    let t = |v: bool| C64::new(f64::from(u8::from(v)), 0.0);
    Some(match op {
        Add => a + b,
        Subtract => a - b,
        Multiply => a * b,
        Divide => a / b,
        Power => a.powc(b),
        Equal => t(a == b),
        NotEqual => t(a != b),
        _ => return None,
    })
}

pub fn binary(op: BinaryOp, a: &Tensor, b: &Tensor) -> EngineResult<Tensor> {
    let out_dtype = binary_dtype(op, a.dtype, b.dtype)?;
    let shape = mlx_engine::ops::broadcast_shapes(op.name(), &a.shape, &b.shape)?;
    let ia = broadcast_map(op.name(), &a.shape, &shape)?;
    let ib = broadcast_map(op.name(), &b.shape, &shape)?;
    if a.is_complex() || b.is_complex() {
        let (av, bv) = (a.complex_values(), b.complex_values());
        let mut out = Vec::with_capacity(ia.len());
        for (&i, &j) in ia.iter().zip(&ib) {
            out.push(complex_binary(op, av[i], bv[j]).ok_or_else(|| EngineError::dtype(op.name(), Dtype::Complex64))?);
        }
        return Ok(Tensor::new(shape, out_dtype, Data::Complex(out)));
    }
    let integral = !out_dtype.is_inexact();
    let (av, bv) = (a.values(), b.values());
    let values = ia
        .iter()
        .zip(&ib)
        .map(|(&i, &j)| real_binary(op, integral, av[i], bv[j]))
        .collect();
    Ok(Tensor::real(shape, out_dtype, values))
}

/// `cond ? x : y` with three-way broadcasting
pub fn select(cond: &Tensor, x: &Tensor, y: &Tensor) -> EngineResult<Tensor> {
    let shape = mlx_engine::ops::broadcast_shapes("where", &cond.shape, &x.shape)?;
    let shape = mlx_engine::ops::broadcast_shapes("where", &shape, &y.shape)?;
    let ic = broadcast_map("where", &cond.shape, &shape)?;
    let ix = broadcast_map("where", &x.shape, &shape)?;
    let iy = broadcast_map("where", &y.shape, &shape)?;
    let out_dtype = promote_types(x.dtype, y.dtype);
    let c = cond.values();
    if out_dtype.is_complex() {
        let (xv, yv) = (x.complex_values(), y.complex_values());
        let values = (0..ic.len())
            .map(|k| if c[ic[k]] != 0.0 { xv[ix[k]] } else { yv[iy[k]] })
            .collect();
        return Ok(Tensor::complex(shape, values));
    }
    let (xv, yv) = (x.values(), y.values());
    let values = (0..ic.len())
        .map(|k| if c[ic[k]] != 0.0 { xv[ix[k]] } else { yv[iy[k]] })
        .collect();
    Ok(Tensor::real(shape, out_dtype, values))
}
