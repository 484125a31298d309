use crate::prelude::ProcessorError;

/// Bounded pool of scratch vectors reused across frames.
///
/// At most `max_outstanding` buffers may be checked out at once; buffers
/// handed back are kept for the next checkout instead of being freed.
pub struct BufferPool<T = f32> {
    buffers: Vec<Vec<T>>,
    max_outstanding: usize,
    outstanding: usize,
}

impl<T: Clone + Default> BufferPool<T> {
    pub fn with_capacity(max_outstanding: usize) -> Self {
        Self {
            buffers: Vec::with_capacity(max_outstanding),
            max_outstanding,
            outstanding: 0,
        }
    }

    /// A zeroed buffer of `length` elements.
    pub fn checkout(&mut self, length: usize) -> Result<Vec<T>, ProcessorError> {
        if self.outstanding >= self.max_outstanding {
            return Err(ProcessorError::BufferExhaustion(format!(
                "all {} buffers in use",
                self.max_outstanding
            )));
        }
        let mut buffer = self.buffers.pop().unwrap_or_default();
        buffer.clear();
        buffer.resize(length, T::default());
        self.outstanding += 1;
        Ok(buffer)
    }

    pub fn release(&mut self, buffer: Vec<T>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.buffers.len() < self.max_outstanding {
            self.buffers.push(buffer);
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn reset(&mut self) {
        self.buffers.clear();
        self.outstanding = 0;
    }
}
