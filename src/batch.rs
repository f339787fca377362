use crate::error::ConfigError;
use crate::extract::RawField;
use std::num::NonZeroUsize;

/// One slice of the raw field sequence submitted in a single request.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    /// 0-based position of this batch in the plan.
    pub index: usize,
    pub fields: &'a [RawField],
}

/// Fixed-size partition of the extracted fields. Borrowing, so it can be
/// iterated any number of times without copying fields.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlan<'a> {
    fields: &'a [RawField],
    size: NonZeroUsize,
}

impl<'a> BatchPlan<'a> {
    pub fn new(fields: &'a [RawField], size: usize) -> Result<Self, ConfigError> {
        let size = NonZeroUsize::new(size).ok_or(ConfigError::InvalidBatchSize(0))?;
        Ok(Self { fields, size })
    }

    pub fn batch_size(&self) -> usize {
        self.size.get()
    }

    pub fn len(&self) -> usize {
        self.fields.len().div_ceil(self.size.get())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Batches starting at `index` (used when the remainder of a failed run
    /// has to be handled differently).
    pub fn remainder(&self, index: usize) -> &'a [RawField] {
        let start = (index * self.size.get()).min(self.fields.len());
        &self.fields[start..]
    }

    pub fn iter(&self) -> Batches<'a> {
        Batches {
            chunks: self.fields.chunks(self.size.get()).enumerate(),
        }
    }
}

impl<'a> IntoIterator for &BatchPlan<'a> {
    type Item = Batch<'a>;
    type IntoIter = Batches<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Batches<'a> {
    chunks: std::iter::Enumerate<std::slice::Chunks<'a, RawField>>,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Batch<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next().map(|(index, fields)| Batch { index, fields })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Batches<'_> {}
