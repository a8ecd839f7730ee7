use ndarray::prelude::*;
use tracing::debug;

use crate::errors::{Result, SamError};
use crate::overlay::mask_dimensions;
use crate::session::RawTensor;
use crate::tensor::Tensor;

/// The three tensors produced by one `Sam::predict` call.
///
/// The caller owns all three. They can only be released together through [`close`], which
/// is idempotent; dropping the value releases them as well.
///
/// [`close`]: SamRawOutput::close
#[derive(Debug)]
pub struct SamRawOutput {
    iou_pred: Tensor<f32>,
    low_res_logits: Tensor<f32>,
    mask: Tensor<bool>,
}

impl SamRawOutput {
    /// Predicted mask quality.
    pub const fn iou_pred(&self) -> &Tensor<f32> {
        &self.iou_pred
    }

    /// Mask scores before thresholding, at the decoder's low resolution.
    pub const fn low_res_logits(&self) -> &Tensor<f32> {
        &self.low_res_logits
    }

    /// Full resolution mask, `[height, width]`.
    pub const fn mask(&self) -> &Tensor<bool> {
        &self.mask
    }

    pub fn mask_view(&self) -> Result<ArrayView2<'_, bool>> {
        self.mask.view2()
    }

    /// Mask dimensions as `(width, height)`.
    pub fn mask_dimensions(&self) -> Result<(u32, u32)> {
        mask_dimensions(self.mask_view()?)
    }

    pub fn close(&mut self) {
        self.iou_pred.release();
        self.low_res_logits.release();
        self.mask.release();
    }

    pub const fn is_closed(&self) -> bool {
        self.iou_pred.is_released() && self.low_res_logits.is_released() && self.mask.is_released()
    }
}

/// Turns the engine's raw output list into an owned [`SamRawOutput`].
///
/// The list order is `[iou_pred, low_res_logits, mask]`. Every tensor is copied out of the
/// engine's buffers before this returns, so the result stays valid after the session moves on
/// or is disposed.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputExtractor;

impl OutputExtractor {
    pub const OUTPUT_COUNT: usize = 3;

    pub fn extract(raw: &[RawTensor<'_>]) -> Result<SamRawOutput> {
        let [iou_pred, low_res_logits, mask] = raw else {
            return Err(SamError::malformed(format!(
                "expected {} output tensors, got {}",
                Self::OUTPUT_COUNT,
                raw.len()
            )));
        };

        let iou_pred = expect_f32(iou_pred, "iou_pred")?;
        let low_res_logits = expect_f32(low_res_logits, "low_res_logits")?;
        let mask = spatial_mask(expect_bool(mask, "mask")?)?;
        debug!(
            iou_pred = ?iou_pred.shape(),
            low_res_logits = ?low_res_logits.shape(),
            mask = ?mask.shape(),
            "detaching model outputs"
        );

        Ok(SamRawOutput {
            iou_pred: Tensor::detach(iou_pred),
            low_res_logits: Tensor::detach(low_res_logits),
            mask: Tensor::detach(mask),
        })
    }
}

fn expect_f32<'a>(raw: &RawTensor<'a>, name: &str) -> Result<ArrayViewD<'a, f32>> {
    match raw {
        RawTensor::F32(view) => Ok(view.clone()),
        other => Err(SamError::malformed(format!(
            "{name} must be f32, got {}",
            other.dtype()
        ))),
    }
}

fn expect_bool<'a>(raw: &RawTensor<'a>, name: &str) -> Result<ArrayViewD<'a, bool>> {
    match raw {
        RawTensor::Bool(view) => Ok(view.clone()),
        other => Err(SamError::malformed(format!(
            "{name} must be bool, got {}",
            other.dtype()
        ))),
    }
}

/// Drop leading unit axes so the mask is `[height, width]`.
fn spatial_mask(mut mask: ArrayViewD<'_, bool>) -> Result<ArrayViewD<'_, bool>> {
    while mask.ndim() > 2 && mask.shape()[0] == 1 {
        mask = mask.index_axis_move(Axis(0), 0);
    }
    if mask.ndim() != 2 {
        return Err(SamError::malformed(format!(
            "mask must have two spatial dimensions, got shape {:?}",
            mask.shape()
        )));
    }
    Ok(mask)
}
