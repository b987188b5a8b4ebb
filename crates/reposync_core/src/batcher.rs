//! Size-triggered batching of items.

use crate::error::{TransformError, TransformResult};

/// Accumulates items and hands them to a callback in batches.
///
/// The callback runs when the buffer reaches `batch_size` items, and once
/// more on [`Batcher::complete`] for any remainder. Intended for serial use.
///
/// # Example
///
/// ```rust
/// use reposync_core::Batcher;
///
/// let mut batcher = Batcher::new(2, |items: Vec<u32>| items.iter().sum::<u32>()).unwrap();
/// assert_eq!(batcher.add(1), None);
/// assert_eq!(batcher.add(2), Some(3));
/// assert_eq!(batcher.add(5), None);
/// assert_eq!(batcher.complete(), Some(5));
/// assert_eq!(batcher.complete(), None);
/// ```
pub struct Batcher<T, R, F>
where
    F: FnMut(Vec<T>) -> R,
{
    batch_size: usize,
    buffer: Vec<T>,
    on_batch_ready: F,
    batches: usize,
}

impl<T, R, F> Batcher<T, R, F>
where
    F: FnMut(Vec<T>) -> R,
{
    /// Creates a batcher. Fails with `InvalidBatchSize` for a zero size.
    pub fn new(batch_size: usize, on_batch_ready: F) -> TransformResult<Self> {
        if batch_size == 0 {
            return Err(TransformError::InvalidBatchSize { size: batch_size });
        }
        Ok(Self {
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            on_batch_ready,
            batches: 0,
        })
    }

    /// Buffers `item`; flushes and returns the callback result when the
    /// buffer is full.
    pub fn add(&mut self, item: T) -> Option<R> {
        self.buffer.push(item);
        if self.buffer.len() >= self.batch_size {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Flushes any buffered items.
    pub fn complete(&mut self) -> Option<R> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.flush())
        }
    }

    /// Configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of buffered items.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Number of batches handed to the callback so far.
    pub fn batches_flushed(&self) -> usize {
        self.batches
    }

    fn flush(&mut self) -> R {
        let items = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        self.batches += 1;
        (self.on_batch_ready)(items)
    }
}
