//! Mini-batch iteration over a [`Dataset`].

use super::{Dataset, RandomSampler, Sampler, SequentialSampler};
use std::marker::PhantomData;
use std::sync::Arc;
use std::vec::IntoIter;

/// Turns the items of one batch into the value the loader yields.
pub trait Collate<T> {
    type Output;

    fn collate(&self, batch: Vec<T>) -> Self::Output;
}

/// Yields collated batches of `batch_size` items in the order chosen by its sampler.
///
/// `D` is the dataset, `T` the item it returns and `C` the collator.
pub struct DataLoader<D, T, C> {
    dataset: Arc<D>,
    collate: Arc<C>,
    sampler: Arc<dyn Sampler>,
    batch_size: usize,
    drop_last: bool,
    _item: PhantomData<fn() -> T>,
}

impl<D, T, C> DataLoader<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    /// Sequential, keeping the last partial batch. A `batch_size` of 0 is treated as 1.
    pub fn new(dataset: D, batch_size: usize, collate: C) -> Self {
        Self {
            dataset: Arc::new(dataset),
            collate: Arc::new(collate),
            sampler: Arc::new(SequentialSampler),
            batch_size: batch_size.max(1),
            drop_last: false,
            _item: PhantomData,
        }
    }

    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    /// Switches between an OS-seeded [`RandomSampler`] and sequential order.
    pub fn shuffle(self, shuffle: bool) -> Self {
        if shuffle {
            self.with_sampler(RandomSampler::new())
        } else {
            self.with_sampler(SequentialSampler)
        }
    }

    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    /// Batches per pass.
    pub fn len(&self) -> usize {
        let items = self.dataset.len();
        match self.drop_last {
            true => items / self.batch_size,
            false => items.div_ceil(self.batch_size),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a pass; every call draws a new order from the sampler.
    pub fn iter(&self) -> Batches<D, T, C> {
        let mut order = self.sampler.sample(self.dataset.len());
        order.truncate(self.len() * self.batch_size);
        Batches {
            dataset: Arc::clone(&self.dataset),
            collate: Arc::clone(&self.collate),
            order: order.into_iter(),
            batch_size: self.batch_size,
            _item: PhantomData,
        }
    }
}

impl<D, T, C> IntoIterator for &DataLoader<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    type Item = C::Output;
    type IntoIter = Batches<D, T, C>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass of a [`DataLoader`].
pub struct Batches<D, T, C> {
    dataset: Arc<D>,
    collate: Arc<C>,
    order: IntoIter<usize>,
    batch_size: usize,
    _item: PhantomData<fn() -> T>,
}

impl<D, T, C> Iterator for Batches<D, T, C>
where
    D: Dataset<T>,
    C: Collate<T>,
{
    type Item = C::Output;

    fn next(&mut self) -> Option<Self::Item> {
        let batch: Vec<T> = self
            .order
            .by_ref()
            .take(self.batch_size)
            .map(|idx| self.dataset.get(idx))
            .collect();
        if batch.is_empty() {
            return None;
        }
        Some(self.collate.collate(batch))
    }
}
