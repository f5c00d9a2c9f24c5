//! Convolution front ends.
//!
//! Every variant lowers to [`Engine::conv_general`] with channels-last
//! layout. Transposed convolutions are expressed as a flipped convolution
//! over the input dilated by the stride.

use crate::array::Array;
use crate::device::Stream;
use crate::dtype::promote_types;
use crate::engine::{ConvParams, Engine};
use crate::error::{EngineError, EngineResult};

use super::float_dtype;

/// Spatial hyperparameters of one convolution call, one entry per spatial axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvSpec {
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    pub dilation: Vec<usize>,
    pub groups: usize,
}

impl ConvSpec {
    /// Unit stride and dilation, no padding, one group
    pub fn new(spatial: usize) -> Self {
        Self {
            stride: vec![1; spatial],
            padding: vec![0; spatial],
            dilation: vec![1; spatial],
            groups: 1,
        }
    }

    pub fn stride(mut self, stride: Vec<usize>) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: Vec<usize>) -> Self {
        self.padding = padding;
        self
    }

    pub fn dilation(mut self, dilation: Vec<usize>) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }
}

fn check(op: &str, input: &Array, weight: &Array, spatial: usize, spec: &ConvSpec) -> EngineResult<()> {
    if input.ndim() != spatial + 2 {
        return Err(EngineError::invalid(
            op,
            format!("input must have {} dimensions, got {}", spatial + 2, input.ndim()),
        ));
    }
    if weight.ndim() != spatial + 2 {
        return Err(EngineError::invalid(
            op,
            format!("weight must have {} dimensions, got {}", spatial + 2, weight.ndim()),
        ));
    }
    for (name, v) in [("stride", &spec.stride), ("padding", &spec.padding), ("dilation", &spec.dilation)] {
        if v.len() != spatial {
            return Err(EngineError::invalid(op, format!("{} must have {} entries", name, spatial)));
        }
    }
    if spec.stride.contains(&0) || spec.dilation.contains(&0) {
        return Err(EngineError::invalid(op, "stride and dilation must be positive"));
    }
    if spec.groups == 0 {
        return Err(EngineError::invalid(op, "groups must be positive"));
    }
    let c_in = input.shape()[spatial + 1];
    let w_in = weight.shape()[spatial + 1];
    if c_in % spec.groups != 0 || w_in * spec.groups != c_in {
        return Err(EngineError::invalid(
            op,
            format!(
                "expected weight input channels {} for {} input channels in {} groups",
                c_in / spec.groups.max(1),
                c_in,
                spec.groups
            ),
        ));
    }
    if weight.shape()[0] % spec.groups != 0 {
        return Err(EngineError::invalid(op, "output channels must be divisible by groups"));
    }
    Ok(())
}

fn conv_nd(
    e: &dyn Engine,
    op: &str,
    input: &Array,
    weight: &Array,
    spatial: usize,
    spec: &ConvSpec,
    s: &Stream,
) -> EngineResult<Array> {
    check(op, input, weight, spatial, spec)?;
    let params = ConvParams {
        stride: spec.stride.clone(),
        padding_lo: spec.padding.clone(),
        padding_hi: spec.padding.clone(),
        kernel_dilation: spec.dilation.clone(),
        input_dilation: vec![1; spatial],
        groups: spec.groups,
        flip: false,
    };
    e.conv_general(input, weight, &params, s)
}

/// Input `[N, L, C_in]`, weight `[C_out, K, C_in / groups]`
pub fn conv1d(e: &dyn Engine, input: &Array, weight: &Array, spec: &ConvSpec, s: &Stream) -> EngineResult<Array> {
    conv_nd(e, "conv1d", input, weight, 1, spec, s)
}

pub fn conv2d(e: &dyn Engine, input: &Array, weight: &Array, spec: &ConvSpec, s: &Stream) -> EngineResult<Array> {
    conv_nd(e, "conv2d", input, weight, 2, spec, s)
}

pub fn conv3d(e: &dyn Engine, input: &Array, weight: &Array, spec: &ConvSpec, s: &Stream) -> EngineResult<Array> {
    conv_nd(e, "conv3d", input, weight, 3, spec, s)
}

/// Transposed convolution with `output_padding` added to the high side
pub fn conv_transpose(
    e: &dyn Engine,
    input: &Array,
    weight: &Array,
    spec: &ConvSpec,
    output_padding: &[usize],
    s: &Stream,
) -> EngineResult<Array> {
    let spatial = input.ndim().saturating_sub(2);
    let op = match spatial {
        1 => "conv_transpose1d",
        2 => "conv_transpose2d",
        3 => "conv_transpose3d",
        _ => "conv_transpose",
    };
    check(op, input, weight, spatial, spec)?;
    if output_padding.len() != spatial {
        return Err(EngineError::invalid(op, format!("output_padding must have {} entries", spatial)));
    }
    let mut lo = Vec::with_capacity(spatial);
    let mut hi = Vec::with_capacity(spatial);
    for i in 0..spatial {
        let k = weight.shape()[i + 1];
        let span = spec.dilation[i] * k.saturating_sub(1);
        if spec.padding[i] > span {
            return Err(EngineError::invalid(op, "padding larger than the dilated kernel"));
        }
        if output_padding[i] >= spec.stride[i].max(spec.dilation[i]) {
            return Err(EngineError::invalid(op, "output_padding must be smaller than stride or dilation"));
        }
        lo.push(span - spec.padding[i]);
        hi.push(span - spec.padding[i] + output_padding[i]);
    }
    let params = ConvParams {
        stride: vec![1; spatial],
        padding_lo: lo,
        padding_hi: hi,
        kernel_dilation: spec.dilation.clone(),
        input_dilation: spec.stride.clone(),
        groups: spec.groups,
        flip: true,
    };
    e.conv_general(input, weight, &params, s)
}

/// Fully general convolution with explicit low/high padding and input dilation
pub fn conv_general(e: &dyn Engine, input: &Array, weight: &Array, params: &ConvParams, s: &Stream) -> EngineResult<Array> {
    let spatial = input.ndim().saturating_sub(2);
    if input.ndim() < 3 || weight.ndim() != input.ndim() {
        return Err(EngineError::invalid(
            "conv_general",
            "input and weight must have the same rank of at least 3",
        ));
    }
    let lists = [
        &params.stride,
        &params.padding_lo,
        &params.padding_hi,
        &params.kernel_dilation,
        &params.input_dilation,
    ];
    if lists.iter().any(|v| v.len() != spatial) {
        return Err(EngineError::invalid(
            "conv_general",
            format!("every parameter list must have {} entries", spatial),
        ));
    }
    let spec = ConvSpec {
        stride: params.stride.clone(),
        padding: params.padding_lo.clone(),
        dilation: params.kernel_dilation.clone(),
        groups: params.groups,
    };
    check("conv_general", input, weight, spatial, &spec)?;
    if params.input_dilation.contains(&0) {
        return Err(EngineError::invalid("conv_general", "input dilation must be positive"));
    }
    e.conv_general(input, weight, params, s)
}

/// Output extent of [`convolve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolveMode {
    /// Every point of overlap, `n + m - 1` samples
    Full,
    /// Centered on the longer input, `max(n, m)` samples
    Same,
    /// Complete overlap only, `max(n, m) - min(n, m) + 1` samples
    Valid,
}

impl ConvolveMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "full" => Some(ConvolveMode::Full),
            "same" => Some(ConvolveMode::Same),
            "valid" => Some(ConvolveMode::Valid),
            _ => None,
        }
    }
}

/// Discrete linear convolution of two non-empty 1-d arrays
pub fn convolve(e: &dyn Engine, a: &Array, v: &Array, mode: ConvolveMode, s: &Stream) -> EngineResult<Array> {
    if a.ndim() != 1 || v.ndim() != 1 {
        return Err(EngineError::invalid("convolve", "inputs must be 1-d"));
    }
    if a.size() == 0 || v.size() == 0 {
        return Err(EngineError::invalid("convolve", "inputs cannot be empty"));
    }
    let (signal, kernel) = if a.size() < v.size() { (v, a) } else { (a, v) };
    let k = kernel.size();
    let (lo, hi) = match mode {
        ConvolveMode::Full => (k - 1, k - 1),
        ConvolveMode::Valid => (0, 0),
        ConvolveMode::Same => (k / 2, (k - 1) / 2),
    };
    let dtype = float_dtype(promote_types(a.dtype(), v.dtype()));
    let input = e.reshape(&e.astype(signal, dtype, s)?, &[1, signal.size(), 1], s)?;
    let weight = e.reshape(&e.astype(kernel, dtype, s)?, &[1, k, 1], s)?;
    let params = ConvParams {
        stride: vec![1],
        padding_lo: vec![lo],
        padding_hi: vec![hi],
        kernel_dilation: vec![1],
        input_dilation: vec![1],
        groups: 1,
        flip: true,
    };
    let out = e.conv_general(&input, &weight, &params, s)?;
    let n = out.size();
    e.reshape(&out, &[n], s)
}

/// Expand a scalar hyperparameter to one entry per spatial axis
pub fn per_axis(value: &[usize], spatial: usize) -> Vec<usize> {
    match value {
        [v] => vec![*v; spatial],
        _ => value.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_per_axis() {
        assert_eq!(per_axis(&[2], 3), vec![2, 2, 2]);
        assert_eq!(per_axis(&[1, 2], 2), vec![1, 2]);
    }

    #[test]
    fn test_convolve_mode_names() {
        assert_eq!(ConvolveMode::from_name("same"), Some(ConvolveMode::Same));
        assert_eq!(ConvolveMode::from_name("circular"), None);
    }

    #[test]
    fn test_spec_builder() {
        let spec = ConvSpec::new(2).stride(vec![2, 2]).groups(4);
        assert_eq!(spec.stride, vec![2, 2]);
        assert_eq!(spec.padding, vec![0, 0]);
        assert_eq!(spec.groups, 4);
    }
}
