//! Seed resolution and per-image random generators.
//!
//! Noise is drawn on the host from a seeded [`StdRng`] and then moved to the
//! generator's device, so a given seed produces the same latents on every backend.

use anyhow::{bail, Result};
use candle_core::{DType, Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::SeedSpec;

/// Exclusive upper bound for randomly drawn seeds.
pub const RANDOM_SEED_BOUND: u64 = u32::MAX as u64;

/// Resolves the seeds for `count` outputs.
///
/// A single seed yields exactly one entry. A list is truncated to `count` entries and
/// padded with random seeds after the supplied prefix. No seed yields `count` random
/// seeds.
pub fn resolve_seeds<R: Rng + ?Sized>(
    spec: Option<&SeedSpec>,
    count: usize,
    rng: &mut R,
) -> Vec<u64> {
    match spec {
        Some(SeedSpec::Single(seed)) => vec![*seed],
        Some(SeedSpec::List(seeds)) => {
            let mut resolved: Vec<u64> = seeds.iter().copied().take(count).collect();
            let missing = count.saturating_sub(resolved.len());
            resolved.extend((0..missing).map(|_| rng.random_range(0..RANDOM_SEED_BOUND)));
            resolved
        }
        None => (0..count)
            .map(|_| rng.random_range(0..RANDOM_SEED_BOUND))
            .collect(),
    }
}

/// Random source bound to a device.
#[derive(Debug, Clone)]
pub struct Generator {
    seed: u64,
    device: Device,
    rng: StdRng,
}

impl Generator {
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            seed,
            device: device.clone(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Draws standard-normal samples of the given shape onto the generator's device.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        let tensor = Tensor::from_vec(values, shape, &Device::Cpu)?
            .to_device(&self.device)?
            .to_dtype(dtype)?;
        Ok(tensor)
    }
}

/// Generator handles for one template instance.
#[derive(Debug, Clone)]
pub enum Generators {
    /// One generator drives the whole batch.
    Single(Generator),
    /// One generator per requested output, in output order.
    PerImage(Vec<Generator>),
}

impl Generators {
    /// Builds generators for `count` outputs, drawing missing seeds from the thread RNG.
    pub fn from_spec(spec: Option<&SeedSpec>, count: usize, device: &Device) -> Self {
        Self::with_rng(spec, count, device, &mut rand::rng())
    }

    pub fn with_rng<R: Rng + ?Sized>(
        spec: Option<&SeedSpec>,
        count: usize,
        device: &Device,
        rng: &mut R,
    ) -> Self {
        let seeds = resolve_seeds(spec, count, rng);
        match spec {
            Some(SeedSpec::Single(seed)) => {
                tracing::info!("Using seed: {seed}");
                Generators::Single(Generator::new(*seed, device))
            }
            _ => {
                tracing::info!("Using seeds: {seeds:?}");
                Generators::PerImage(seeds.iter().map(|s| Generator::new(*s, device)).collect())
            }
        }
    }

    pub fn seeds(&self) -> Vec<u64> {
        match self {
            Generators::Single(generator) => vec![generator.seed()],
            Generators::PerImage(generators) => generators.iter().map(Generator::seed).collect(),
        }
    }

    /// Draws a `(batch, ..item_dims)` noise tensor.
    ///
    /// A single generator fills the batch sequentially; per-image generators each
    /// fill their own row and must match the batch size.
    pub fn randn(&mut self, batch: usize, item_dims: &[usize], dtype: DType) -> Result<Tensor> {
        let mut dims = Vec::with_capacity(item_dims.len() + 1);
        match self {
            Generators::Single(generator) => {
                dims.push(batch);
                dims.extend_from_slice(item_dims);
                generator.randn(dims, dtype)
            }
            Generators::PerImage(generators) => {
                if generators.len() != batch {
                    bail!(
                        "{} generators were configured, but the requested batch size is {batch}",
                        generators.len()
                    );
                }
                dims.push(1);
                dims.extend_from_slice(item_dims);
                let rows = generators
                    .iter_mut()
                    .map(|g| g.randn(dims.clone(), dtype))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Tensor::cat(&rows, 0)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(1234)
    }

    #[test]
    fn absent_seed_draws_one_per_output() {
        let seeds = resolve_seeds(None, 3, &mut rng());
        assert_eq!(seeds.len(), 3);
        assert!(seeds.iter().all(|s| *s < RANDOM_SEED_BOUND));
    }

    #[test]
    fn single_seed_yields_one_generator() {
        let spec = SeedSpec::Single(42);
        assert_eq!(resolve_seeds(Some(&spec), 4, &mut rng()), vec![42]);
        let generators = Generators::with_rng(Some(&spec), 4, &Device::Cpu, &mut rng());
        assert!(matches!(generators, Generators::Single(_)));
        assert_eq!(generators.seeds(), vec![42]);
    }

    #[test]
    fn list_seed_is_truncated() {
        let spec = SeedSpec::List(vec![5, 6, 7, 8]);
        assert_eq!(resolve_seeds(Some(&spec), 2, &mut rng()), vec![5, 6]);
    }

    #[test]
    fn short_list_is_padded_after_prefix() {
        let spec = SeedSpec::List(vec![7]);
        let seeds = resolve_seeds(Some(&spec), 3, &mut rng());
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[0], 7);
        assert!(seeds[1..].iter().all(|s| *s < RANDOM_SEED_BOUND));
    }

    #[test]
    fn empty_list_is_fully_random() {
        let spec = SeedSpec::List(Vec::new());
        assert_eq!(resolve_seeds(Some(&spec), 2, &mut rng()).len(), 2);
    }

    #[test]
    fn generator_count_matches_output_count() {
        for count in 1..5 {
            let g = Generators::with_rng(None, count, &Device::Cpu, &mut rng());
            assert_eq!(g.seeds().len(), count);
            let spec = SeedSpec::List(vec![1]);
            let g = Generators::with_rng(Some(&spec), count, &Device::Cpu, &mut rng());
            assert_eq!(g.seeds().len(), count);
        }
    }

    #[test]
    fn same_seed_same_noise() -> Result<()> {
        let mut a = Generator::new(7, &Device::Cpu);
        let mut b = Generator::new(7, &Device::Cpu);
        let x = a.randn((2, 3), DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let y = b.randn((2, 3), DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(x, y);
        let mut c = Generator::new(8, &Device::Cpu);
        let z = c.randn((2, 3), DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_ne!(x, z);
        Ok(())
    }

    #[test]
    fn generator_state_advances_between_draws() -> Result<()> {
        let mut g = Generator::new(7, &Device::Cpu);
        let first = g.randn(4, DType::F32)?.to_vec1::<f32>()?;
        let second = g.randn(4, DType::F32)?.to_vec1::<f32>()?;
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn per_image_rows_follow_seed_order() -> Result<()> {
        let spec = SeedSpec::List(vec![11, 22]);
        let mut generators = Generators::with_rng(Some(&spec), 2, &Device::Cpu, &mut rng());
        let batch = generators.randn(2, &[3], DType::F32)?;
        assert_eq!(batch.dims(), &[2, 3]);

        let mut second = Generator::new(22, &Device::Cpu);
        let expected = second.randn((1, 3), DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(batch.get(1)?.to_vec1::<f32>()?, expected);
        Ok(())
    }

    #[test]
    fn per_image_batch_mismatch_is_an_error() {
        let mut generators =
            Generators::with_rng(Some(&SeedSpec::List(vec![1, 2])), 2, &Device::Cpu, &mut rng());
        assert!(generators.randn(3, &[4], DType::F32).is_err());
    }

    #[test]
    fn single_generator_fills_any_batch() -> Result<()> {
        let mut generators =
            Generators::with_rng(Some(&SeedSpec::Single(3)), 1, &Device::Cpu, &mut rng());
        let batch = generators.randn(3, &[2, 2], DType::F32)?;
        assert_eq!(batch.dims(), &[3, 2, 2]);
        Ok(())
    }
}
