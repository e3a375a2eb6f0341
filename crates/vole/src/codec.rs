// Raw little-endian tensor payloads shared by the safetensors and checkpoint
// formats.
//
// Both directions go through the f64 view of the tensor, which is exact for
// every float dtype and for integers up to 2^53.

use std::io::Read;

use half::{bf16, f16};

use vole_core::backend::Backend;
use vole_core::dtype::DType;
use vole_core::error::{Error, Result};
use vole_core::shape::Shape;
use vole_core::tensor::Tensor;

/// Bytes needed to hold a tensor of `dims` elements of `dtype`, or an error
/// when the count overflows.
pub(crate) fn payload_len(dims: &[usize], dtype: DType) -> Result<usize> {
    dims.iter()
        .try_fold(dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::msg(format!("shape {dims:?} of {dtype} is too large to address")))
}

/// Read exactly `len` bytes. The buffer grows with the bytes actually
/// present, so a corrupt length fails at end of input instead of
/// allocating up front.
pub(crate) fn read_payload(reader: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(Error::msg(format!(
            "unexpected end of input: needed {len} bytes, found {}",
            buf.len()
        )));
    }
    Ok(buf)
}

pub(crate) fn tensor_to_bytes<B: Backend>(tensor: &Tensor<B>) -> Result<Vec<u8>> {
    let data = tensor.to_f64_vec()?;
    Ok(match tensor.dtype() {
        DType::F16 => data
            .iter()
            .flat_map(|&v| f16::from_f64(v).to_le_bytes())
            .collect(),
        DType::BF16 => data
            .iter()
            .flat_map(|&v| bf16::from_f64(v).to_le_bytes())
            .collect(),
        DType::F32 => data
            .iter()
            .flat_map(|&v| (v as f32).to_le_bytes())
            .collect(),
        DType::F64 => data.iter().flat_map(|&v| v.to_le_bytes()).collect(),
        DType::U8 => data.iter().map(|&v| v as u8).collect(),
        DType::U32 => data
            .iter()
            .flat_map(|&v| (v as u32).to_le_bytes())
            .collect(),
        DType::I64 => data
            .iter()
            .flat_map(|&v| (v as i64).to_le_bytes())
            .collect(),
    })
}

pub(crate) fn tensor_from_bytes<B: Backend>(
    raw: &[u8],
    dims: Vec<usize>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let expected = payload_len(&dims, dtype)?;
    let shape = Shape::new(dims);
    if raw.len() != expected {
        return Err(Error::msg(format!(
            "expected {expected} bytes for {} elements of {dtype}, got {}",
            shape.elem_count(),
            raw.len()
        )));
    }

    match dtype {
        DType::F16 => {
            let v: Vec<f16> = raw
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]))
                .collect();
            Tensor::from_slice(&v, shape, device)
        }
        DType::BF16 => {
            let v: Vec<bf16> = raw
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]))
                .collect();
            Tensor::from_slice(&v, shape, device)
        }
        DType::F32 => {
            let v: Vec<f32> = raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_slice(&v, shape, device)
        }
        DType::F64 => {
            let v: Vec<f64> = raw
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_slice(&v, shape, device)
        }
        DType::U8 => Tensor::from_slice(raw, shape, device),
        DType::U32 => {
            let v: Vec<u32> = raw
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::from_slice(&v, shape, device)
        }
        DType::I64 => {
            let v: Vec<i64> = raw
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            Tensor::from_slice(&v, shape, device)
        }
    }
}
