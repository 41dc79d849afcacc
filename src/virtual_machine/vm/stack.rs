use crate::virtual_machine::errors::VmError;

/// Which machine stack a [`Stack`] is, selecting the errors it reports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StackKind {
    /// Evaluation stack of Words.
    Evaluation,
    /// Pool-allocation stack.
    Pool,
}

/// Fixed-capacity stack.
///
/// Depth 0 is the top. Checks never mutate: a failed call leaves the stack as
/// it was.
#[derive(Clone, Debug)]
pub struct Stack<T> {
    items: Vec<T>,
    capacity: usize,
    kind: StackKind,
}

impl<T: Copy> Stack<T> {
    pub fn new(capacity: usize, kind: StackKind) -> Self {
        Self {
            items: Vec::with_capacity(capacity.min(4096)),
            capacity,
            kind,
        }
    }

    fn underflow(&self) -> VmError {
        match self.kind {
            StackKind::Evaluation => VmError::StackUnderflow,
            StackKind::Pool => VmError::CallStackUnderflow,
        }
    }

    fn overflow(&self) -> VmError {
        match self.kind {
            StackKind::Evaluation => VmError::StackOverflow,
            StackKind::Pool => VmError::CallStackOverflow,
        }
    }

    fn index(&self, depth: usize) -> Option<usize> {
        self.items.len().checked_sub(depth)?.checked_sub(1)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fails unless at least `n` elements are present.
    pub fn require(&self, n: usize) -> Result<(), VmError> {
        if self.items.len() < n {
            Err(self.underflow())
        } else {
            Ok(())
        }
    }

    /// Fails unless `n` more elements fit.
    pub fn reserve(&self, n: usize) -> Result<(), VmError> {
        if self.capacity - self.items.len().min(self.capacity) < n {
            Err(self.overflow())
        } else {
            Ok(())
        }
    }

    pub fn push(&mut self, value: T) -> Result<(), VmError> {
        self.reserve(1)?;
        self.items.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<T, VmError> {
        self.items.pop().ok_or_else(|| self.underflow())
    }

    /// Element `depth` below the top.
    pub fn peek(&self, depth: usize) -> Result<T, VmError> {
        self.index(depth)
            .map(|index| self.items[index])
            .ok_or_else(|| self.underflow())
    }

    pub fn top(&self) -> Result<T, VmError> {
        self.peek(0)
    }

    /// Overwrites element `depth` below the top.
    pub fn set(&mut self, depth: usize, value: T) -> Result<(), VmError> {
        let index = self.index(depth).ok_or_else(|| self.underflow())?;
        self.items[index] = value;
        Ok(())
    }

    /// Removes `n` elements from the top.
    pub fn drop_n(&mut self, n: usize) -> Result<(), VmError> {
        self.require(n)?;
        self.items.truncate(self.items.len() - n);
        Ok(())
    }

    /// Elements bottom to top.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}
