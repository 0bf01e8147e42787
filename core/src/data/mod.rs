//! Datasets, splits and batching.
//!
//! [`Dataset`] gives indexed access, [`Subset`] and [`random_split`] partition one, a [`Sampler`]
//! orders a pass and [`DataLoader`] batches it through a [`Collate`]. [`moving_mnist`] builds
//! the Moving MNIST loaders on top.

pub mod loader;
pub mod moving_mnist;
pub mod npy;
pub mod sampler;

pub use loader::{Batches, Collate, DataLoader};
pub use moving_mnist::{MovingMnist, MovingMnistDataLoaders, WindowCollate};
pub use sampler::{RandomSampler, Sampler, SequentialSampler};

use crate::error::{Error, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Indexed collection of items of type `T`, such as videos.
pub trait Dataset<T>: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Item `index`; may panic when `index >= len()`.
    fn get(&self, index: usize) -> T;
}

impl<T: Clone + Send + Sync> Dataset<T> for Vec<T> {
    fn len(&self) -> usize {
        self.len()
    }

    fn get(&self, index: usize) -> T {
        self[index].clone()
    }
}

/// A view of a dataset restricted to `indices`.
#[derive(Debug)]
pub struct Subset<D> {
    dataset: Arc<D>,
    indices: Vec<usize>,
}

impl<D> Subset<D> {
    pub fn new(dataset: Arc<D>, indices: Vec<usize>) -> Self {
        Self { dataset, indices }
    }

    /// Positions of this subset's items in the underlying dataset.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<T, D: Dataset<T>> Dataset<T> for Subset<D> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> T {
        self.dataset.get(self.indices[index])
    }
}

/// Lengths of a split of `total` items by `fractions`.
///
/// Each length is `floor(total * fraction)`; the leftover items go one at a time to the parts in
/// order, so every item lands in exactly one part.
pub fn split_lengths(total: usize, fractions: &[f64]) -> Result<Vec<usize>> {
    if fractions.is_empty() || fractions.iter().any(|f| !(0.0..=1.0).contains(f)) {
        return Err(Error::Dataset(format!(
            "split fractions must lie in [0, 1], got {:?}",
            fractions
        )));
    }
    let sum: f64 = fractions.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(Error::Dataset(format!(
            "split fractions must sum to 1, got {sum}"
        )));
    }

    let mut lengths: Vec<usize> = fractions
        .iter()
        .map(|f| (total as f64 * f).floor() as usize)
        .collect();
    let assigned: usize = lengths.iter().sum();
    for i in 0..total.saturating_sub(assigned) {
        let n = lengths.len();
        lengths[i % n] += 1;
    }
    Ok(lengths)
}

/// Randomly partitions `dataset` into non-overlapping subsets sized by `fractions`.
pub fn random_split<T, D, R>(dataset: D, fractions: &[f64], rng: &mut R) -> Result<Vec<Subset<D>>>
where
    D: Dataset<T>,
    R: Rng + ?Sized,
{
    let lengths = split_lengths(dataset.len(), fractions)?;
    let mut indices: Vec<usize> = (0..dataset.len()).collect();
    indices.shuffle(rng);

    let dataset = Arc::new(dataset);
    let mut offset = 0;
    Ok(lengths
        .into_iter()
        .map(|len| {
            let part = indices[offset..offset + len].to_vec();
            offset += len;
            Subset::new(dataset.clone(), part)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_split_lengths_distributes_remainder() {
        assert_eq!(split_lengths(10, &[0.7, 0.2, 0.1]).unwrap(), vec![7, 2, 1]);
        // floor gives [3, 1, 0]; the 1 leftover goes to the first part
        assert_eq!(split_lengths(5, &[0.7, 0.2, 0.1]).unwrap(), vec![4, 1, 0]);
        assert_eq!(split_lengths(0, &[0.5, 0.5]).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_split_lengths_rejects_bad_fractions() {
        assert!(split_lengths(10, &[0.5, 0.4]).is_err());
        assert!(split_lengths(10, &[1.5, -0.5]).is_err());
        assert!(split_lengths(10, &[]).is_err());
    }

    #[test]
    fn test_random_split_partitions() {
        let data: Vec<usize> = (0..10).collect();
        let mut rng = StdRng::seed_from_u64(42);
        let parts = random_split(data, &[0.7, 0.2, 0.1], &mut rng).unwrap();

        let lens: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![7, 2, 1]);

        let mut seen: Vec<usize> = parts
            .iter()
            .flat_map(|p| (0..p.len()).map(move |i| p.get(i)))
            .collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_random_split_is_seeded() {
        let split = |seed| {
            let parts = random_split((0..20).collect::<Vec<u32>>(), &[0.5, 0.5], &mut StdRng::seed_from_u64(seed)).unwrap();
            parts[0].indices().to_vec()
        };
        assert_eq!(split(3), split(3));
    }
}
