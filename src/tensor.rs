use ndarray::prelude::*;

use crate::errors::{Result, SamError};

/// Owned n-dimensional array with an explicit release point.
///
/// A `Tensor` is the single owner of its buffer. `release` frees the buffer early and is
/// idempotent; dropping the tensor frees it as well. Every read after release fails with
/// [`SamError::InvalidState`] instead of observing stale data.
#[derive(Debug, Clone)]
pub struct Tensor<T> {
    data: Option<ArrayD<T>>,
}

impl<T> Tensor<T> {
    pub const fn new(data: ArrayD<T>) -> Self {
        Self { data: Some(data) }
    }

    /// Detach an engine-borrowed view into an independently owned tensor.
    pub fn detach(view: ArrayViewD<'_, T>) -> Self
    where
        T: Clone,
    {
        Self::new(view.to_owned())
    }

    pub fn view(&self) -> Result<ArrayViewD<'_, T>> {
        self.data
            .as_ref()
            .map(ArrayBase::view)
            .ok_or_else(|| SamError::released("view"))
    }

    pub fn shape(&self) -> Result<&[usize]> {
        self.data
            .as_ref()
            .map(ArrayBase::shape)
            .ok_or_else(|| SamError::released("shape"))
    }

    pub fn view2(&self) -> Result<ArrayView2<'_, T>> {
        self.view()?
            .into_dimensionality::<Ix2>()
            .map_err(|e| SamError::InvalidState {
                operation: "view2".to_string(),
                reason: e.to_string(),
            })
    }

    pub fn into_array(self) -> Result<ArrayD<T>> {
        self.data.ok_or_else(|| SamError::released("into_array"))
    }

    pub fn release(&mut self) {
        self.data = None;
    }

    pub const fn is_released(&self) -> bool {
        self.data.is_none()
    }
}

impl<T> From<ArrayD<T>> for Tensor<T> {
    fn from(data: ArrayD<T>) -> Self {
        Self::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_is_idempotent_and_blocks_reads() {
        let mut tensor = Tensor::new(ArrayD::<f32>::zeros(IxDyn(&[2, 3])));
        assert_eq!(tensor.shape().unwrap(), &[2, 3]);

        tensor.release();
        tensor.release();

        assert!(tensor.is_released());
        assert!(matches!(tensor.view(), Err(SamError::InvalidState { .. })));
        assert!(matches!(tensor.shape(), Err(SamError::InvalidState { .. })));
        assert!(tensor.into_array().is_err());
    }

    #[test]
    fn test_detach_copies_the_view() {
        let source = vec![true, false, false, true];
        let detached = {
            let view = ArrayViewD::from_shape(IxDyn(&[2, 2]), &source).unwrap();
            Tensor::detach(view)
        };
        drop(source);

        let view = detached.view2().unwrap();
        assert!(view[[0, 0]]);
        assert!(!view[[0, 1]]);
        assert!(view[[1, 1]]);
    }

    #[test]
    fn test_view2_rejects_other_ranks() {
        let tensor = Tensor::new(ArrayD::<f32>::zeros(IxDyn(&[1, 2, 2])));
        assert!(tensor.view2().is_err());
    }
}
