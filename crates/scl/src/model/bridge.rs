//! Conversions between host-side `Vec<f32>` rows and burn tensors.
//!
//! Used at the edges of the crate: feeding precomputed vectors into a
//! [`LinearBackbone`](crate::model::backbone::LinearBackbone) and reading
//! embeddings or extracted features back out.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::{Result, SclError};

/// Stack equal-length rows into a `(rows, dim)` tensor.
///
/// Fails with [`SclError::ShapeMismatch`] when `rows` is empty, a row is
/// empty, or the rows have different lengths.
pub fn rows_to_tensor<B: Backend>(rows: &[Vec<f32>], device: &B::Device) -> Result<Tensor<B, 2>> {
    let first = rows
        .first()
        .ok_or_else(|| SclError::ShapeMismatch("no rows to convert".to_string()))?;
    let dim = first.len();
    if dim == 0 {
        return Err(SclError::ShapeMismatch(
            "row dimension must be > 0".to_string(),
        ));
    }
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
        return Err(SclError::ShapeMismatch(format!(
            "row {i} has length {}, expected {dim}",
            row.len()
        )));
    }

    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Ok(Tensor::from_data(
        TensorData::new(flat, [rows.len(), dim]),
        device,
    ))
}

/// Read a `(rows, dim)` tensor back into host rows.
pub fn tensor_to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<Vec<f32>>> {
    let [_, dim] = tensor.dims();
    let flat: Vec<f32> = tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| SclError::Data(format!("failed to read tensor: {e:?}")))?;
    if dim == 0 {
        return Ok(Vec::new());
    }
    Ok(flat.chunks(dim).map(<[f32]>::to_vec).collect())
}

/// Extract a single f64 scalar from a one-element tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
