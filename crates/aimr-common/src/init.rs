//! Seeded weight initialization.
//!
//! candle's default initializers draw from its own device RNG, which cannot be
//! seeded on the CPU backend. Freshly built models are therefore
//! re-initialized here from a `StdRng`: kernels get a truncated Glorot normal,
//! biases get zeros.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{ModelError, Result};

/// Build the RNG for a component. `None` draws from OS entropy.
pub fn component_rng(seed: Option<u64>, offset: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(offset)),
        None => StdRng::from_entropy(),
    }
}

/// Glorot fan sum for a kernel shape.
///
/// Works for dense `(out, in)`, conv `(out, in, k, k)` and transposed conv
/// `(in, out, k, k)` kernels since the sum is symmetric.
pub fn glorot_fan_sum(dims: &[usize]) -> usize {
    let receptive: usize = dims.iter().skip(2).product();
    (dims[0] + dims[1]) * receptive.max(1)
}

/// Draw `n` samples from a normal distribution truncated at two standard
/// deviations.
pub fn truncated_normal(rng: &mut StdRng, n: usize, stdev: f64) -> Result<Vec<f32>> {
    let normal = Normal::new(0.0, stdev)
        .map_err(|e| ModelError::InvalidConfig(format!("invalid init stdev {}: {}", stdev, e)))?;
    let bound = 2.0 * stdev;
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let x: f64 = normal.sample(rng);
        if x.abs() <= bound {
            out.push(x as f32);
        }
    }
    Ok(out)
}

/// Re-initialize every variable of `varmap`.
///
/// Rank >= 2 variables get a truncated Glorot normal, variables whose name
/// ends in `bias` are zeroed, everything else (batch-norm scale and running
/// statistics) keeps its constructor value. Variables are visited in name
/// order so that a given seed always produces the same weights.
///
/// Returns the number of variables that were overwritten.
pub fn glorot_init(varmap: &VarMap, rng: &mut StdRng) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| ModelError::InvalidConfig("weight registry lock poisoned".to_string()))?;

    let mut named: Vec<(&String, &Var)> = data.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));

    let mut touched = 0;
    for (name, var) in named {
        let dims = var.dims().to_vec();
        if name.ends_with("bias") {
            var.set(&var.zeros_like()?)?;
            touched += 1;
        } else if dims.len() >= 2 {
            let stdev = (2.0 / glorot_fan_sum(&dims) as f64).sqrt();
            let values = truncated_normal(rng, var.elem_count(), stdev)?;
            let fresh = Tensor::from_vec(values, dims.as_slice(), var.device())?
                .to_dtype(var.dtype())?;
            var.set(&fresh)?;
            touched += 1;
        }
    }
    Ok(touched)
}
