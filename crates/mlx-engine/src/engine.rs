//! The Engine Interface
//!
//! [`Engine`] is the narrow surface the binding layer consumes. It lists
//! primitives only; everything that can be expressed in terms of them lives
//! in [`crate::ops`] as free functions, so every engine gets the composite
//! catalog for free and composites are traced exactly like primitives.
//!
//! ## Callbacks
//!
//! Transforms take the function being transformed as a borrowed
//! [`HostFn`]. It is deliberately not `Send`: a host callable may only be
//! invoked on the thread that owns the host runtime. Engine-produced
//! functions ([`NativeFn`], [`NativeKwFn`]) are `Send + Sync` and can run
//! anywhere.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::array::{Array, HostBuffer};
use crate::device::{Device, DeviceKind, Group, Stream};
use crate::dtype::Dtype;
use crate::error::EngineResult;

// ============================================================================
// Function types
// ============================================================================

/// A function supplied by the caller, invoked synchronously by the engine.
pub type HostFn<'a> = dyn FnMut(&[Array]) -> EngineResult<Vec<Array>> + 'a;

/// An engine-produced array function (compiled or imported).
pub type NativeFn = Arc<dyn Fn(&[Array]) -> EngineResult<Vec<Array>> + Send + Sync>;

/// An engine-produced function taking positional and named arrays.
pub type NativeKwFn =
    Arc<dyn Fn(&[Array], &[(String, Array)]) -> EngineResult<Vec<Array>> + Send + Sync>;

// ============================================================================
// Operation enums
// ============================================================================

/// Elementwise single-input operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Abs,
    Negative,
    Sign,
    Sqrt,
    Rsqrt,
    Square,
    Reciprocal,
    Exp,
    Expm1,
    Log,
    Log2,
    Log10,
    Log1p,
    Sin,
    Cos,
    Tan,
    ArcSin,
    ArcCos,
    ArcTan,
    Sinh,
    Cosh,
    Tanh,
    ArcSinh,
    ArcCosh,
    ArcTanh,
    Sigmoid,
    Erf,
    ErfInv,
    Floor,
    Ceil,
    /// Round half to even at the given number of decimals
    Round(i32),
    LogicalNot,
    BitwiseInvert,
    IsNan,
    IsInf,
    IsPosInf,
    IsNegInf,
    IsFinite,
    StopGradient,
    Real,
    Imag,
    Conjugate,
    /// Encode to e4m3 bytes held in uint8
    ToFp8,
    /// Decode uint8 e4m3 bytes to float32
    FromFp8,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Abs => "abs",
            UnaryOp::Negative => "negative",
            UnaryOp::Sign => "sign",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Rsqrt => "rsqrt",
            UnaryOp::Square => "square",
            UnaryOp::Reciprocal => "reciprocal",
            UnaryOp::Exp => "exp",
            UnaryOp::Expm1 => "expm1",
            UnaryOp::Log => "log",
            UnaryOp::Log2 => "log2",
            UnaryOp::Log10 => "log10",
            UnaryOp::Log1p => "log1p",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::ArcSin => "arcsin",
            UnaryOp::ArcCos => "arccos",
            UnaryOp::ArcTan => "arctan",
            UnaryOp::Sinh => "sinh",
            UnaryOp::Cosh => "cosh",
            UnaryOp::Tanh => "tanh",
            UnaryOp::ArcSinh => "arcsinh",
            UnaryOp::ArcCosh => "arccosh",
            UnaryOp::ArcTanh => "arctanh",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Erf => "erf",
            UnaryOp::ErfInv => "erfinv",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Round(_) => "round",
            UnaryOp::LogicalNot => "logical_not",
            UnaryOp::BitwiseInvert => "bitwise_invert",
            UnaryOp::IsNan => "isnan",
            UnaryOp::IsInf => "isinf",
            UnaryOp::IsPosInf => "isposinf",
            UnaryOp::IsNegInf => "isneginf",
            UnaryOp::IsFinite => "isfinite",
            UnaryOp::StopGradient => "stop_gradient",
            UnaryOp::Real => "real",
            UnaryOp::Imag => "imag",
            UnaryOp::Conjugate => "conjugate",
            UnaryOp::ToFp8 => "to_fp8",
            UnaryOp::FromFp8 => "from_fp8",
        }
    }
}

/// Elementwise two-input operations with broadcasting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Remainder,
    Power,
    Maximum,
    Minimum,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LogicalAnd,
    LogicalOr,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    LeftShift,
    RightShift,
    ArcTan2,
    LogAddExp,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Subtract => "subtract",
            BinaryOp::Multiply => "multiply",
            BinaryOp::Divide => "divide",
            BinaryOp::FloorDivide => "floor_divide",
            BinaryOp::Remainder => "remainder",
            BinaryOp::Power => "power",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
            BinaryOp::Equal => "equal",
            BinaryOp::NotEqual => "not_equal",
            BinaryOp::Less => "less",
            BinaryOp::LessEqual => "less_equal",
            BinaryOp::Greater => "greater",
            BinaryOp::GreaterEqual => "greater_equal",
            BinaryOp::LogicalAnd => "logical_and",
            BinaryOp::LogicalOr => "logical_or",
            BinaryOp::BitwiseAnd => "bitwise_and",
            BinaryOp::BitwiseOr => "bitwise_or",
            BinaryOp::BitwiseXor => "bitwise_xor",
            BinaryOp::LeftShift => "left_shift",
            BinaryOp::RightShift => "right_shift",
            BinaryOp::ArcTan2 => "arctan2",
            BinaryOp::LogAddExp => "logaddexp",
        }
    }

    /// Comparison operators produce booleans
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
                | BinaryOp::LogicalAnd
                | BinaryOp::LogicalOr
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitwiseAnd
                | BinaryOp::BitwiseOr
                | BinaryOp::BitwiseXor
                | BinaryOp::LeftShift
                | BinaryOp::RightShift
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Prod,
    Max,
    Min,
    All,
    Any,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
            ReduceOp::All => "all",
            ReduceOp::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgReduceOp {
    ArgMin,
    ArgMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanOp {
    Sum,
    Prod,
    Max,
    Min,
    LogAddExp,
}

/// Matrix factorizations and solves. Each op documents its output count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinalgOp {
    Inv,
    TriInv { upper: bool },
    Cholesky { upper: bool },
    CholeskyInv { upper: bool },
    Pinv,
    /// (Q, R)
    Qr,
    /// (U, S, Vt) or S alone
    Svd { compute_uv: bool },
    /// (P, L, U)
    Lu,
    /// (LU, pivots)
    LuFactor,
    Solve,
    SolveTriangular { upper: bool },
    /// (eigenvalues, eigenvectors), complex
    Eig,
    EigVals,
    /// (eigenvalues, eigenvectors), real symmetric
    Eigh { upper: bool },
    EigvalsH { upper: bool },
}

impl LinalgOp {
    pub fn name(self) -> &'static str {
        match self {
            LinalgOp::Inv => "inv",
            LinalgOp::TriInv { .. } => "tri_inv",
            LinalgOp::Cholesky { .. } => "cholesky",
            LinalgOp::CholeskyInv { .. } => "cholesky_inv",
            LinalgOp::Pinv => "pinv",
            LinalgOp::Qr => "qr",
            LinalgOp::Svd { .. } => "svd",
            LinalgOp::Lu => "lu",
            LinalgOp::LuFactor => "lu_factor",
            LinalgOp::Solve => "solve",
            LinalgOp::SolveTriangular { .. } => "solve_triangular",
            LinalgOp::Eig => "eig",
            LinalgOp::EigVals => "eigvals",
            LinalgOp::Eigh { .. } => "eigh",
            LinalgOp::EigvalsH { .. } => "eigvalsh",
        }
    }

    /// Number of arrays the op produces
    pub fn output_count(self) -> usize {
        match self {
            LinalgOp::Svd { compute_uv: true } | LinalgOp::Lu => 3,
            LinalgOp::Qr | LinalgOp::LuFactor | LinalgOp::Eig | LinalgOp::Eigh { .. } => 2,
            _ => 1,
        }
    }

    /// Number of array inputs the op consumes
    pub fn input_count(self) -> usize {
        match self {
            LinalgOp::Solve | LinalgOp::SolveTriangular { .. } => 2,
            _ => 1,
        }
    }
}

/// Fourier transform flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FftOp {
    pub inverse: bool,
    pub real: bool,
}

/// Parameters of the general N-d convolution.
///
/// Layout is channels-last: input `[N, *spatial, C_in]`, weight
/// `[C_out, *kernel, C_in / groups]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvParams {
    pub stride: Vec<usize>,
    pub padding_lo: Vec<usize>,
    pub padding_hi: Vec<usize>,
    pub kernel_dilation: Vec<usize>,
    pub input_dilation: Vec<usize>,
    pub groups: usize,
    pub flip: bool,
}

/// Quantization scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantMode {
    Affine,
    Mxfp4,
    Nvfp4,
}

impl QuantMode {
    pub fn name(self) -> &'static str {
        match self {
            QuantMode::Affine => "affine",
            QuantMode::Mxfp4 => "mxfp4",
            QuantMode::Nvfp4 => "nvfp4",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "affine" => Some(QuantMode::Affine),
            "mxfp4" => Some(QuantMode::Mxfp4),
            "nvfp4" => Some(QuantMode::Nvfp4),
            _ => None,
        }
    }

    /// Group size used when the caller gives none
    pub fn default_group_size(self) -> usize {
        match self {
            QuantMode::Affine => 64,
            QuantMode::Mxfp4 => 32,
            QuantMode::Nvfp4 => 16,
        }
    }

    pub fn default_bits(self) -> u32 {
        4
    }

    /// Affine carries biases; the fp4 schemes only scales
    pub fn output_count(self) -> usize {
        match self {
            QuantMode::Affine => 3,
            QuantMode::Mxfp4 | QuantMode::Nvfp4 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PadMode {
    Constant,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveOp {
    Sum,
    Max,
    Min,
    Gather,
    SumScatter,
}

impl CollectiveOp {
    pub fn name(self) -> &'static str {
        match self {
            CollectiveOp::Sum => "all_sum",
            CollectiveOp::Max => "all_max",
            CollectiveOp::Min => "all_min",
            CollectiveOp::Gather => "all_gather",
            CollectiveOp::SumScatter => "sum_scatter",
        }
    }
}

// ============================================================================
// IO and administrative types
// ============================================================================

/// Serialization format of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Npy,
    Npz,
    Safetensors,
    Gguf,
}

impl FileFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "npy" => Some(FileFormat::Npy),
            "npz" => Some(FileFormat::Npz),
            "safetensors" => Some(FileFormat::Safetensors),
            "gguf" => Some(FileFormat::Gguf),
            _ => None,
        }
    }

    /// Infer the format from a path's extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_name)
    }

    pub fn name(self) -> &'static str {
        match self {
            FileFormat::Npy => "npy",
            FileFormat::Npz => "npz",
            FileFormat::Safetensors => "safetensors",
            FileFormat::Gguf => "gguf",
        }
    }
}

/// Typed metadata value stored alongside arrays
#[derive(Debug, Clone)]
pub enum MetaValue {
    Str(String),
    StrList(Vec<String>),
    Array(Array),
}

/// Result of loading a file
#[derive(Debug, Clone)]
pub enum Loaded {
    Single(Array),
    Arrays {
        arrays: IndexMap<String, Array>,
        metadata: IndexMap<String, MetaValue>,
    },
}

/// Value in a device information table
#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    Str(String),
    Int(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStat {
    Active,
    Peak,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLimit {
    Memory,
    Cache,
    Wired,
}

// ============================================================================
// Custom kernels and export sessions
// ============================================================================

/// Source-level description of a custom device kernel
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSpec {
    pub name: String,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub source: String,
    pub header: String,
    pub ensure_row_contiguous: bool,
    pub atomic_outputs: bool,
}

/// Compile-time template argument of a kernel launch
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateArg {
    Int(i64),
    Bool(bool),
    Dtype(Dtype),
}

/// One launch of a custom kernel
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    pub inputs: Vec<Array>,
    pub template: Vec<(String, TemplateArg)>,
    pub grid: [usize; 3],
    pub threadgroup: [usize; 3],
    pub output_shapes: Vec<Vec<usize>>,
    pub output_dtypes: Vec<Dtype>,
    pub init_value: Option<f64>,
    pub verbose: bool,
}

/// A compiled custom kernel
pub trait CustomKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn launch(&self, launch: &KernelLaunch, stream: &Stream) -> EngineResult<Vec<Array>>;
}

/// A stateful function export in progress
pub trait ExportSession: fmt::Debug {
    /// Trace `f` on `args` and append the trace to the session.
    /// The last `kwarg_names.len()` args are named.
    fn record(
        &mut self,
        f: &mut HostFn<'_>,
        args: &[Array],
        kwarg_names: &[String],
    ) -> EngineResult<()>;

    /// Flush the session to its file
    fn close(&mut self) -> EngineResult<()>;

    fn is_closed(&self) -> bool;
}

// ============================================================================
// Engine
// ============================================================================

/// The numerical engine consumed by the binding layer.
pub trait Engine: Send + Sync + fmt::Debug {
    /// Backend name, used in error messages
    fn name(&self) -> &str;

    /// Backend version string
    fn version(&self) -> &str;

    // ---- construction and readback -------------------------------------

    /// Build an array from a flat row-major buffer, casting to `dtype`
    fn from_buffer(&self, data: HostBuffer, shape: &[usize], dtype: Dtype) -> EngineResult<Array>;

    /// Read an array back as a flat row-major buffer in its natural host type
    fn to_buffer(&self, a: &Array) -> EngineResult<HostBuffer>;

    fn astype(&self, a: &Array, dtype: Dtype, s: &Stream) -> EngineResult<Array>;

    /// Reinterpret the bytes of `a` as `dtype`; the last axis is rescaled
    fn view(&self, a: &Array, dtype: Dtype, s: &Stream) -> EngineResult<Array>;

    // ---- elementwise ----------------------------------------------------

    fn unary(&self, op: UnaryOp, a: &Array, s: &Stream) -> EngineResult<Array>;

    fn binary(&self, op: BinaryOp, a: &Array, b: &Array, s: &Stream) -> EngineResult<Array>;

    fn select(&self, cond: &Array, x: &Array, y: &Array, s: &Stream) -> EngineResult<Array>;

    // ---- reductions -----------------------------------------------------

    /// Reduce over `axes` (already non-negative and deduplicated)
    fn reduce(
        &self,
        op: ReduceOp,
        a: &Array,
        axes: &[usize],
        keepdims: bool,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn arg_reduce(
        &self,
        op: ArgReduceOp,
        a: &Array,
        axis: usize,
        keepdims: bool,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn scan(
        &self,
        op: ScanOp,
        a: &Array,
        axis: usize,
        reverse: bool,
        inclusive: bool,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn sort(&self, a: &Array, axis: usize, s: &Stream) -> EngineResult<Array>;

    fn argsort(&self, a: &Array, axis: usize, s: &Stream) -> EngineResult<Array>;

    fn partition(&self, a: &Array, kth: usize, axis: usize, s: &Stream) -> EngineResult<Array>;

    fn argpartition(&self, a: &Array, kth: usize, axis: usize, s: &Stream)
        -> EngineResult<Array>;

    // ---- shape and indexing ----------------------------------------------

    fn reshape(&self, a: &Array, shape: &[usize], s: &Stream) -> EngineResult<Array>;

    fn transpose(&self, a: &Array, perm: &[usize], s: &Stream) -> EngineResult<Array>;

    fn broadcast_to(&self, a: &Array, shape: &[usize], s: &Stream) -> EngineResult<Array>;

    fn concatenate(&self, arrays: &[Array], axis: usize, s: &Stream) -> EngineResult<Array>;

    /// Strided slice; per axis the selected indices are `start + k*stride`
    /// strictly before `stop` in the stride direction.
    fn slice(
        &self,
        a: &Array,
        start: &[i64],
        stop: &[i64],
        strides: &[i64],
        s: &Stream,
    ) -> EngineResult<Array>;

    fn slice_update(
        &self,
        a: &Array,
        update: &Array,
        start: &[i64],
        stop: &[i64],
        strides: &[i64],
        s: &Stream,
    ) -> EngineResult<Array>;

    /// Gather along `axis`; indices are wrapped when negative
    fn take(&self, a: &Array, indices: &Array, axis: usize, s: &Stream) -> EngineResult<Array>;

    fn take_along_axis(
        &self,
        a: &Array,
        indices: &Array,
        axis: usize,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn put_along_axis(
        &self,
        a: &Array,
        indices: &Array,
        values: &Array,
        axis: usize,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn pad(
        &self,
        a: &Array,
        low: &[usize],
        high: &[usize],
        value: &Array,
        mode: PadMode,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn as_strided(
        &self,
        a: &Array,
        shape: &[usize],
        strides: &[i64],
        offset: usize,
        s: &Stream,
    ) -> EngineResult<Array>;

    // ---- linear algebra, fft, convolution --------------------------------

    fn matmul(&self, a: &Array, b: &Array, s: &Stream) -> EngineResult<Array>;

    fn linalg(&self, op: LinalgOp, inputs: &[Array], s: &Stream) -> EngineResult<Vec<Array>>;

    /// Transform over `axes` with output lengths `n` (one per axis)
    fn fft(
        &self,
        a: &Array,
        n: &[usize],
        axes: &[usize],
        op: FftOp,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn conv_general(
        &self,
        input: &Array,
        weight: &Array,
        params: &ConvParams,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn quantize(
        &self,
        w: &Array,
        group_size: usize,
        bits: u32,
        mode: QuantMode,
        s: &Stream,
    ) -> EngineResult<Vec<Array>>;

    #[allow(clippy::too_many_arguments)]
    fn dequantize(
        &self,
        w: &Array,
        scales: &Array,
        biases: Option<&Array>,
        group_size: usize,
        bits: u32,
        mode: QuantMode,
        dtype: Option<Dtype>,
        s: &Stream,
    ) -> EngineResult<Array>;

    // ---- random -----------------------------------------------------------

    /// Reset the implicit global key
    fn seed(&self, seed: u64);

    /// An explicit `uint32[2]` key
    fn key(&self, seed: u64) -> EngineResult<Array>;

    /// `num` fresh keys as a `[num, 2]` array. Without a key the global key is advanced.
    fn split_key(&self, key: Option<&Array>, num: usize, s: &Stream) -> EngineResult<Array>;

    /// Uniform samples in `[0, 1)`
    fn random_uniform(
        &self,
        shape: &[usize],
        dtype: Dtype,
        key: Option<&Array>,
        s: &Stream,
    ) -> EngineResult<Array>;

    /// Standard normal samples
    fn random_normal(
        &self,
        shape: &[usize],
        dtype: Dtype,
        key: Option<&Array>,
        s: &Stream,
    ) -> EngineResult<Array>;

    // ---- transforms --------------------------------------------------------

    /// Trace `f` on `inputs` into a replayable function.
    /// With `shapeless` the result accepts inputs of other shapes.
    fn compile(&self, f: &mut HostFn<'_>, inputs: &[Array], shapeless: bool)
        -> EngineResult<NativeFn>;

    /// Outputs of `f` and the vector-Jacobian products with `cotangents`
    fn vjp(
        &self,
        f: &mut HostFn<'_>,
        primals: &[Array],
        cotangents: &[Array],
    ) -> EngineResult<(Vec<Array>, Vec<Array>)>;

    /// Like [`Engine::vjp`], with the cotangents built by `seed` from the
    /// outputs of the same trace. `f` runs once.
    fn vjp_with(
        &self,
        f: &mut HostFn<'_>,
        primals: &[Array],
        seed: &mut HostFn<'_>,
    ) -> EngineResult<(Vec<Array>, Vec<Array>)>;

    /// Outputs of `f` and the Jacobian-vector products with `tangents`
    fn jvp(
        &self,
        f: &mut HostFn<'_>,
        primals: &[Array],
        tangents: &[Array],
    ) -> EngineResult<(Vec<Array>, Vec<Array>)>;

    /// Map `f` over the given input axes; `None` broadcasts an input
    fn vmap(
        &self,
        f: &mut HostFn<'_>,
        inputs: &[Array],
        in_axes: &[Option<usize>],
        out_axes: &[Option<usize>],
    ) -> EngineResult<Vec<Array>>;

    /// Evaluate `f` without keeping intermediates for differentiation
    fn checkpoint(&self, f: &mut HostFn<'_>, inputs: &[Array]) -> EngineResult<Vec<Array>> {
        f(inputs)
    }

    fn export_function(
        &self,
        path: &Path,
        f: &mut HostFn<'_>,
        args: &[Array],
        kwarg_names: &[String],
        shapeless: bool,
    ) -> EngineResult<()>;

    fn exporter(&self, path: &Path, shapeless: bool) -> EngineResult<Box<dyn ExportSession>>;

    fn import_function(&self, path: &Path) -> EngineResult<NativeKwFn>;

    /// Write the graph that produced `outputs` in Graphviz format
    fn export_to_dot(&self, path: &Path, outputs: &[Array]) -> EngineResult<()>;

    // ---- evaluation ----------------------------------------------------------

    fn eval(&self, arrays: &[Array]) -> EngineResult<()>;

    fn async_eval(&self, arrays: &[Array]) -> EngineResult<()> {
        self.eval(arrays)
    }

    fn synchronize(&self, s: Option<&Stream>) -> EngineResult<()>;

    /// `inputs` unchanged, with `dependencies` scheduled before them.
    /// Eager engines have computed both already.
    fn depends(&self, inputs: &[Array], _dependencies: &[Array]) -> EngineResult<Vec<Array>> {
        Ok(inputs.to_vec())
    }

    // ---- files ----------------------------------------------------------------

    fn load(&self, path: &Path, format: FileFormat, s: &Stream) -> EngineResult<Loaded>;

    fn save(&self, path: &Path, a: &Array) -> EngineResult<()>;

    fn save_safetensors(
        &self,
        path: &Path,
        arrays: &IndexMap<String, Array>,
        metadata: &IndexMap<String, String>,
    ) -> EngineResult<()>;

    fn save_gguf(
        &self,
        path: &Path,
        arrays: &IndexMap<String, Array>,
        metadata: &IndexMap<String, MetaValue>,
    ) -> EngineResult<()>;

    // ---- devices, streams, memory ----------------------------------------------

    fn default_stream(&self, device: Device) -> Stream;

    fn new_stream(&self, device: Device) -> EngineResult<Stream>;

    fn is_available(&self, device: Device) -> bool;

    fn device_count(&self, kind: DeviceKind) -> usize;

    /// Descriptive properties of `device`; keys depend on the backend
    fn device_info(&self, device: Device) -> EngineResult<IndexMap<String, InfoValue>>;

    fn memory_stat(&self, stat: MemoryStat) -> usize;

    fn reset_peak_memory(&self);

    /// Set a limit and return the previous one
    fn set_limit(&self, limit: MemoryLimit, bytes: usize) -> EngineResult<usize>;

    fn clear_cache(&self);

    fn metal_is_available(&self) -> bool;

    fn metal_device_info(&self) -> EngineResult<IndexMap<String, InfoValue>>;

    fn metal_start_capture(&self, path: &Path) -> EngineResult<()>;

    fn metal_stop_capture(&self) -> EngineResult<()>;

    fn metal_kernel(&self, spec: KernelSpec) -> EngineResult<Arc<dyn CustomKernel>>;

    // ---- distributed ----------------------------------------------------------------

    fn distributed_is_available(&self, backend: &str) -> bool;

    /// Initialize the distributed backend. `None` when unavailable and not strict.
    fn init_distributed(&self, strict: bool, backend: &str) -> EngineResult<Option<Group>>;

    fn split_group(&self, group: &Group, color: i64, key: i64) -> EngineResult<Group>;

    fn collective(
        &self,
        op: CollectiveOp,
        a: &Array,
        group: Option<&Group>,
        s: &Stream,
    ) -> EngineResult<Array>;

    fn send(&self, a: &Array, dst: usize, group: Option<&Group>, s: &Stream)
        -> EngineResult<Array>;

    fn recv(
        &self,
        shape: &[usize],
        dtype: Dtype,
        src: usize,
        group: Option<&Group>,
        s: &Stream,
    ) -> EngineResult<Array>;
}
