use crate::tensor::Tensor;

/// The gradients of one bucket, handed to a communication hook once the
/// whole bucket is ready.
///
/// Read-only after construction. The tensor order is the order in which the
/// reducer scatters results back into per-parameter storage, so hooks must
/// preserve it.
#[derive(Debug, Clone)]
pub struct GradBucket {
    index: usize,
    is_last: bool,
    tensors: Vec<Tensor>,
}

impl GradBucket {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self {
            index: 0,
            is_last: false,
            tensors,
        }
    }

    /// A bucket tagged with its position in the backward pass.
    pub fn with_index(index: usize, is_last: bool, tensors: Vec<Tensor>) -> Self {
        Self {
            index,
            is_last,
            tensors,
        }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Position of this bucket among the buckets of one backward pass.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this is the final bucket of the backward pass.
    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.shape().to_vec()).collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.tensors.iter().map(Tensor::size_in_bytes).sum()
    }
}
