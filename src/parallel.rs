use rayon::prelude::*;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

/// Runs `func` for every index in `range`, on the rayon pool when `parallel`
/// is set and on the calling thread otherwise.
///
/// Every simulation phase is threaded through this flag so a whole tick can
/// be forced onto a single thread, which makes runs bit-reproducible.
pub fn parallel_for<F>(parallel: bool, range: Range<usize>, func: F)
where
    F: Fn(usize) + Send + Sync,
{
    if parallel {
        range.into_par_iter().for_each(func);
    } else {
        for i in range {
            func(i);
        }
    }
}

/// Mutable indexed iteration with the same serial/parallel switch as
/// [`parallel_for`].
pub fn for_each_indexed_mut<T, F>(parallel: bool, items: &mut [T], func: F)
where
    T: Send,
    F: Fn(usize, &mut T) + Send + Sync,
{
    if parallel {
        items.par_iter_mut().enumerate().for_each(|(i, item)| func(i, item));
    } else {
        for (i, item) in items.iter_mut().enumerate() {
            func(i, item);
        }
    }
}

/// Lock-free f64 accumulator on top of an `AtomicU64`.
///
/// Accumulation phases use relaxed ordering only; the fork/join boundary of
/// the surrounding parallel pass is what publishes the sums to the next
/// phase. `set` is sequentially consistent since it only runs at phase
/// boundaries.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        AtomicF64(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn add(&self, value: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let updated = (f64::from_bits(current) + value).to_bits();
            match self
                .0
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
