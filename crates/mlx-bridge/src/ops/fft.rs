//! Discrete Fourier transforms.

use mlx_engine::ops::fft;
use mlx_engine::FftOp;

use super::one;
use crate::dispatch::TableBuilder;

/// One-axis, two-axis and n-axis names per transform kind
const KINDS: &[([&str; 3], FftOp)] = &[
    (["fft", "fft2", "fftn"], FftOp { inverse: false, real: false }),
    (["ifft", "ifft2", "ifftn"], FftOp { inverse: true, real: false }),
    (["rfft", "rfft2", "rfftn"], FftOp { inverse: false, real: true }),
    (["irfft", "irfft2", "irfftn"], FftOp { inverse: true, real: true }),
];

pub(crate) fn register(t: &mut TableBuilder) {
    for &([name, two, nd], op) in KINDS {
        t.op(name, &["a", "n", "axis"], move |core, args| {
            let a = args.array(core, "a")?;
            let n = args.opt_usize("n")?;
            let axis = args.int_or("axis", -1)?;
            let s = args.stream(core)?;
            one(core, |e| fft::fft1(e, &a, n, axis, op, &s))
        });

        t.op(two, &["a", "s", "axes"], move |core, args| {
            let a = args.array(core, "a")?;
            let sizes = args.opt_shape("s")?;
            let axes = args.axes("axes")?.unwrap_or_else(|| vec![-2, -1]);
            let s = args.stream(core)?;
            one(core, |e| fft::fftn(e, &a, sizes.as_deref(), Some(axes.as_slice()), op, &s))
        });

        t.op(nd, &["a", "s", "axes"], move |core, args| {
            let a = args.array(core, "a")?;
            let sizes = args.opt_shape("s")?;
            let axes = args.axes("axes")?;
            let s = args.stream(core)?;
            one(core, |e| fft::fftn(e, &a, sizes.as_deref(), axes.as_deref(), op, &s))
        });
    }

    t.op("fftshift", &["a", "axes"], |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axes")?);
        let s = args.stream(core)?;
        one(core, |e| fft::fftshift(e, &a, axes.as_deref(), &s))
    });
    t.op("ifftshift", &["a", "axes"], |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axes")?);
        let s = args.stream(core)?;
        one(core, |e| fft::ifftshift(e, &a, axes.as_deref(), &s))
    });
}

#[cfg(test)]
mod tests {
    use crate::core::Core;
    use crate::value::Value;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::new()))
    }

    fn floats(values: &[f64]) -> Value {
        Value::list(values.iter().map(|&x| Value::Float(x)).collect())
    }

    #[test]
    fn test_every_variant_registered() {
        let core = core();
        for name in ["fft", "ifft2", "rfftn", "irfft2", "fftshift", "ifftshift"] {
            assert!(core.respond_to(name), "missing {}", name);
        }
    }

    #[test]
    fn test_rfft_halves_last_axis() {
        let core = core();
        let out = core.call("rfft", vec![floats(&[1.0, 0.0, 0.0, 0.0])]).unwrap();
        assert_eq!(out.as_array().unwrap().shape(), vec![3]);
    }

    #[test]
    fn test_fftshift_rolls_to_center() {
        let core = core();
        let out = core.call("fftshift", vec![floats(&[0.0, 1.0, 2.0, 3.0])]).unwrap();
        assert_eq!(out.as_array().unwrap().to_a(&core).unwrap(), floats(&[2.0, 3.0, 0.0, 1.0]));
    }
}
