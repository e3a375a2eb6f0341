// Safetensors: Interoperable state dict files (HuggingFace format)
//
// The safetensors format stores tensors in a single flat file:
//
//   ┌──────────────┬──────────────────────┬───────────────────────┐
//   │ 8 bytes      │ N bytes              │ raw data bytes        │
//   │ header size  │ JSON header (UTF-8)  │ (contiguous, LE)      │
//   │ (u64 LE)     │                      │                       │
//   └──────────────┴──────────────────────┴───────────────────────┘
//
// JSON header example:
//   {
//     "__metadata__": { "format": "vole" },
//     "0.mask":      { "dtype": "F32", "shape": [6, 6], "data_offsets": [0, 144] },
//     "0.w_query.weight": { ... }
//   }
//
// JSON objects carry no order, so entries are written back to back in
// state dict order and read back sorted by their data offsets. A loaded
// StateDict therefore lists its keys in the order they were exported.
//
// Usage:
//   safetensors::save_module("model.safetensors", &model)?;
//   let report = safetensors::load_module("model.safetensors", &model, true)?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::info;
use serde_json::{json, Map, Value};

use vole_core::backend::Backend;
use vole_core::error::{Error, Result};
use vole_core::DType;
use vole_nn::{LoadReport, Module, StateDict};

use crate::codec::{payload_len, read_payload, tensor_from_bytes, tensor_to_bytes};

const METADATA_KEY: &str = "__metadata__";
const FORMAT: &str = "vole";
const MAX_HEADER_SIZE: usize = 100_000_000;

fn dtype_to_st(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "F16",
        DType::BF16 => "BF16",
        DType::F32 => "F32",
        DType::F64 => "F64",
        DType::U8 => "U8",
        DType::U32 => "U32",
        DType::I64 => "I64",
    }
}

fn st_to_dtype(s: &str) -> Result<DType> {
    match s {
        "F16" => Ok(DType::F16),
        "BF16" => Ok(DType::BF16),
        "F32" => Ok(DType::F32),
        "F64" => Ok(DType::F64),
        "U8" | "BOOL" => Ok(DType::U8),
        "U32" => Ok(DType::U32),
        "I64" => Ok(DType::I64),
        _ => Err(Error::msg(format!("safetensors: unsupported dtype {s}"))),
    }
}

/// One tensor entry of a parsed header.
struct HeaderEntry {
    name: String,
    dtype: DType,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

fn usize_field(v: &Value, key: &str, what: &str) -> Result<usize> {
    v.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| Error::msg(format!("safetensors: '{key}' has a non-integer {what}")))
}

fn parse_header(json_str: &str) -> Result<Vec<HeaderEntry>> {
    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| Error::msg(format!("safetensors: invalid JSON header: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::msg("safetensors: header is not a JSON object"))?;

    let mut entries = Vec::with_capacity(obj.len());
    for (key, val) in obj {
        if key == METADATA_KEY {
            continue;
        }
        let dtype = val
            .get("dtype")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::msg(format!("safetensors: '{key}' missing dtype")))?;
        let shape = val
            .get("shape")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::msg(format!("safetensors: '{key}' missing shape")))?
            .iter()
            .map(|d| usize_field(d, key, "dimension"))
            .collect::<Result<Vec<_>>>()?;
        let offsets = val
            .get("data_offsets")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::msg(format!("safetensors: '{key}' missing data_offsets")))?;
        if offsets.len() != 2 {
            return Err(Error::msg(format!(
                "safetensors: '{key}' data_offsets must have exactly 2 elements"
            )));
        }
        let start = usize_field(&offsets[0], key, "offset")?;
        let end = usize_field(&offsets[1], key, "offset")?;
        if end < start {
            return Err(Error::msg(format!(
                "safetensors: '{key}' has inverted data_offsets [{start}, {end}]"
            )));
        }

        let dtype = st_to_dtype(dtype)?;
        let needed = payload_len(&shape, dtype)
            .map_err(|e| Error::msg(format!("safetensors: '{key}': {e}")))?;
        if needed != end - start {
            return Err(Error::msg(format!(
                "safetensors: '{key}' needs {needed} bytes but data_offsets span {}",
                end - start
            )));
        }

        entries.push(HeaderEntry {
            name: key.clone(),
            dtype,
            shape,
            start,
            end,
        });
    }

    // Empty entries share their start with the next one; the end keeps
    // them in front of it.
    entries.sort_by_key(|e| (e.start, e.end));
    let mut cursor = 0;
    for e in &entries {
        if e.start != cursor {
            return Err(Error::msg(format!(
                "safetensors: '{}' starts at byte {} but the previous entry ends at {cursor}",
                e.name, e.start
            )));
        }
        cursor = e.end;
    }
    Ok(entries)
}

/// Write a state dict in safetensors format.
pub fn write_safetensors<B: Backend>(writer: &mut impl Write, state: &StateDict<B>) -> Result<()> {
    let mut payload: Vec<u8> = Vec::new();
    let mut header = Map::new();
    header.insert(METADATA_KEY.to_string(), json!({ "format": FORMAT }));

    for (name, tensor) in state.iter() {
        let bytes = tensor_to_bytes(tensor)?;
        let start = payload.len();
        payload.extend_from_slice(&bytes);
        header.insert(
            name.to_string(),
            json!({
                "dtype": dtype_to_st(tensor.dtype()),
                "shape": tensor.dims(),
                "data_offsets": [start, payload.len()],
            }),
        );
    }

    let header_json = serde_json::to_string(&Value::Object(header))
        .map_err(|e| Error::msg(format!("safetensors: cannot encode header: {e}")))?;
    let header_bytes = header_json.as_bytes();

    writer.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
    writer.write_all(header_bytes)?;
    writer.write_all(&payload)?;
    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Vec<HeaderEntry>> {
    let mut size_buf = [0u8; 8];
    reader.read_exact(&mut size_buf)?;
    let header_size = u64::from_le_bytes(size_buf) as usize;
    if header_size > MAX_HEADER_SIZE {
        return Err(Error::msg(format!(
            "safetensors: header size {header_size} bytes is unreasonably large"
        )));
    }

    let header_bytes = read_payload(reader, header_size)?;
    let header_str = std::str::from_utf8(&header_bytes)
        .map_err(|e| Error::msg(format!("safetensors: invalid UTF-8 header: {e}")))?;
    parse_header(header_str)
}

/// Read a state dict in safetensors format. Tensors land on `device`.
pub fn read_safetensors<B: Backend>(
    reader: &mut impl Read,
    device: &B::Device,
) -> Result<StateDict<B>> {
    let entries = read_header(reader)?;

    let total = entries.last().map_or(0, |e| e.end);
    let payload = read_payload(reader, total)?;

    let mut state = StateDict::new();
    for entry in entries {
        let raw = &payload[entry.start..entry.end];
        let tensor = tensor_from_bytes::<B>(raw, entry.shape, entry.dtype, device)
            .map_err(|e| Error::msg(format!("safetensors: '{}': {e}", entry.name)))?;
        state.insert(entry.name, tensor);
    }
    Ok(state)
}

/// Serialize a state dict to an in-memory safetensors buffer.
pub fn to_bytes<B: Backend>(state: &StateDict<B>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_safetensors(&mut buf, state)?;
    Ok(buf)
}

pub fn from_bytes<B: Backend>(data: &[u8], device: &B::Device) -> Result<StateDict<B>> {
    let mut cursor = std::io::Cursor::new(data);
    read_safetensors(&mut cursor, device)
}

/// Save a state dict to a `.safetensors` file.
pub fn save_state_dict<B: Backend>(path: impl AsRef<Path>, state: &StateDict<B>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    write_safetensors(&mut writer, state)?;
    writer.flush()?;
    info!("saved {} tensors to {}", state.len(), path.display());
    Ok(())
}

/// Load a `.safetensors` file into a state dict on `device`.
pub fn load_state_dict<B: Backend>(
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<StateDict<B>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let state = read_safetensors(&mut reader, device)?;
    info!("loaded {} tensors from {}", state.len(), path.display());
    Ok(state)
}

/// Save a module's parameters and persistent buffers.
///
/// ```rust,no_run
/// use vole::prelude::*;
/// use vole::safetensors;
///
/// let dev = CpuDevice::default();
/// let linear = Linear::<CpuBackend>::new(3, 2, true, DType::F32, &dev).unwrap();
/// safetensors::save_module("linear.safetensors", &linear).unwrap();
/// ```
pub fn save_module<B: Backend, M: Module<B> + ?Sized>(
    path: impl AsRef<Path>,
    module: &M,
) -> Result<()> {
    save_state_dict(path, &module.state_dict())
}

/// Load a file written by [`save_module`] into `module`, in place.
///
/// The file is decoded on the device of the module's first registered
/// tensor; `load_state_dict` copies any other slot across as needed. A
/// module with nothing registered only has its header read: every key in
/// the file is unexpected.
pub fn load_module<B: Backend, M: Module<B> + ?Sized>(
    path: impl AsRef<Path>,
    module: &M,
    strict: bool,
) -> Result<LoadReport> {
    let Some((_, slot)) = module.named_slots().into_iter().next() else {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        let unexpected: Vec<String> = read_header(&mut reader)?
            .into_iter()
            .map(|e| e.name)
            .collect();
        if strict && !unexpected.is_empty() {
            return Err(Error::KeyMismatch {
                missing: Vec::new(),
                unexpected,
            });
        }
        return Ok(LoadReport {
            unexpected,
            ..LoadReport::default()
        });
    };
    let state = load_state_dict::<B>(path, slot.tensor().device())?;
    module.load_state_dict(&state, strict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::Tensor;
    use vole_cpu::{CpuBackend, CpuDevice};

    type CpuTensor = Tensor<CpuBackend>;

    #[test]
    fn test_header_carries_format_and_offsets() {
        let dev = CpuDevice::default();
        let mut sd = StateDict::new();
        sd.insert(
            "fc.weight",
            CpuTensor::from_f64_slice(&[1.0; 12], (3, 4), DType::F32, &dev).unwrap(),
        );
        let bytes = to_bytes(&sd).unwrap();

        let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        let header: Value = serde_json::from_slice(&bytes[8..8 + header_len]).unwrap();
        assert_eq!(header["__metadata__"]["format"], "vole");
        let entry = &header["fc.weight"];
        assert_eq!(entry["dtype"], "F32");
        assert_eq!(entry["shape"], json!([3, 4]));
        assert_eq!(entry["data_offsets"], json!([0, 48]));
        assert_eq!(bytes.len(), 8 + header_len + 48);
    }

    #[test]
    fn test_key_order_follows_offsets() {
        let dev = CpuDevice::default();
        let mut sd = StateDict::new();
        for key in ["z.weight", "a.bias", "m.running_var"] {
            sd.insert(key, CpuTensor::ones((2,), DType::F32, &dev).unwrap());
        }
        let loaded = from_bytes::<CpuBackend>(&to_bytes(&sd).unwrap(), &dev).unwrap();
        let keys: Vec<&str> = loaded.keys().collect();
        assert_eq!(keys, vec!["z.weight", "a.bias", "m.running_var"]);
    }

    #[test]
    fn test_empty_entry_keeps_its_place() {
        let dev = CpuDevice::default();
        let mut sd = StateDict::new();
        sd.insert("z.weight", CpuTensor::ones((2,), DType::F32, &dev).unwrap());
        sd.insert("y.empty", CpuTensor::zeros((0,), DType::F32, &dev).unwrap());
        sd.insert("a.bias", CpuTensor::ones((2,), DType::F32, &dev).unwrap());
        let loaded = from_bytes::<CpuBackend>(&to_bytes(&sd).unwrap(), &dev).unwrap();
        let keys: Vec<&str> = loaded.keys().collect();
        assert_eq!(keys, vec!["z.weight", "y.empty", "a.bias"]);
    }

    fn raw_file(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_corrupt_headers_are_errors() {
        let dev = CpuDevice::default();
        let huge_offsets =
            r#"{"w":{"dtype":"U8","shape":[18446744073709551615],"data_offsets":[0,18446744073709551615]}}"#;
        let overflowing_shape =
            r#"{"w":{"dtype":"F32","shape":[4294967296,4294967296,16],"data_offsets":[0,4]}}"#;
        let gap = r#"{"a":{"dtype":"U8","shape":[2],"data_offsets":[0,2]},"b":{"dtype":"U8","shape":[2],"data_offsets":[3,5]}}"#;
        let wrong_size = r#"{"w":{"dtype":"F32","shape":[2],"data_offsets":[0,4]}}"#;

        for header in [huge_offsets, overflowing_shape, gap, wrong_size] {
            let bytes = raw_file(header, &[0u8; 8]);
            assert!(
                from_bytes::<CpuBackend>(&bytes, &dev).is_err(),
                "accepted {header}"
            );
        }
    }

    #[test]
    fn test_dtypes_survive() {
        let dev = CpuDevice::default();
        let mut sd = StateDict::new();
        sd.insert(
            "pi",
            CpuTensor::from_f64_slice(&[std::f64::consts::PI, -0.0], (2,), DType::F64, &dev)
                .unwrap(),
        );
        sd.insert(
            "half",
            CpuTensor::from_f64_slice(&[0.1, 65504.0], (2,), DType::F16, &dev).unwrap(),
        );
        sd.insert(
            "count",
            CpuTensor::from_f64_slice(&[42.0], (), DType::I64, &dev).unwrap(),
        );
        sd.insert(
            "mask",
            CpuTensor::from_f64_slice(&[0.0, 1.0, 255.0], (3,), DType::U8, &dev).unwrap(),
        );

        let loaded = from_bytes::<CpuBackend>(&to_bytes(&sd).unwrap(), &dev).unwrap();
        for (key, original) in sd.iter() {
            let restored = loaded.get(key).unwrap();
            assert!(original.equal(restored).unwrap(), "{key} changed");
        }
        assert_eq!(loaded.get("count").unwrap().dims(), &[] as &[usize]);
    }

    #[test]
    fn test_empty_state_dict() {
        let sd: StateDict<CpuBackend> = StateDict::new();
        let loaded = from_bytes::<CpuBackend>(&to_bytes(&sd).unwrap(), &CpuDevice::default())
            .unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let dev = CpuDevice::default();
        let mut sd = StateDict::new();
        sd.insert("w", CpuTensor::ones((4,), DType::F32, &dev).unwrap());
        let bytes = to_bytes(&sd).unwrap();
        assert!(from_bytes::<CpuBackend>(&bytes[..bytes.len() - 3], &dev).is_err());
    }

    #[test]
    fn test_decodes_onto_requested_device() {
        let mut sd = StateDict::new();
        sd.insert(
            "w",
            CpuTensor::ones((2,), DType::F32, &CpuDevice::new(0)).unwrap(),
        );
        let loaded = from_bytes::<CpuBackend>(&to_bytes(&sd).unwrap(), &CpuDevice::new(1)).unwrap();
        assert_eq!(loaded.get("w").unwrap().device(), &CpuDevice::new(1));
    }
}
