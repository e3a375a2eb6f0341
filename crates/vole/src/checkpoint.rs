// Checkpoint: Native binary format for state dicts and training resume
//
// State dict file (version 1):
//
//   Header:
//     magic:   [u8; 4]  = b"VOLE"
//     version: u32 LE   = 1
//     count:   u32 LE   = number of entries
//
//   For each entry, in state dict order:
//     key_len:  u32 LE
//     key:      [u8; key_len]  (UTF-8 dotted path, e.g. "0.w_query.weight")
//     dtype:    u8             (0=F32, 1=F64, 2=U8, 3=U32, 4=I64, 5=F16, 6=BF16)
//     ndim:     u32 LE
//     dims:     [u32 LE; ndim]
//     data_len: u64 LE         (in bytes)
//     data:     [u8; data_len] (raw little-endian typed data)
//
// Training checkpoint (version 2) has the same magic followed by tagged
// sections, so readers can skip what they do not know:
//
//   tag 0x01  model state dict   count: u32, then entries as above
//   tag 0x03  metadata           epoch: u64, global_step: u64, best_loss: f64,
//                                n: u32, loss_history: [f64; n]
//   tag 0xFF  end of file
//
// Usage:
//   checkpoint::save_module("model.vole", &model)?;
//   checkpoint::load_module("model.vole", &model, true)?;
//
//   let ckpt = TrainingCheckpoint::from_module(&model)?.with_epoch(3);
//   checkpoint::save_training("run.vole", &ckpt)?;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use log::info;

use vole_core::backend::Backend;
use vole_core::error::{Error, Result};
use vole_core::DType;
use vole_nn::{LoadReport, Module, StateDict};

use crate::codec::{read_payload, tensor_from_bytes, tensor_to_bytes};

const MAGIC: &[u8; 4] = b"VOLE";
const VERSION: u32 = 1;
const TRAINING_VERSION: u32 = 2;

const TAG_MODEL: u8 = 0x01;
// 0x02 is reserved for optimizer state.
const TAG_METADATA: u8 = 0x03;
const TAG_EOF: u8 = 0xFF;

fn dtype_to_u8(dtype: DType) -> u8 {
    match dtype {
        DType::F32 => 0,
        DType::F64 => 1,
        DType::U8 => 2,
        DType::U32 => 3,
        DType::I64 => 4,
        DType::F16 => 5,
        DType::BF16 => 6,
    }
}

fn u8_to_dtype(v: u8) -> Result<DType> {
    match v {
        0 => Ok(DType::F32),
        1 => Ok(DType::F64),
        2 => Ok(DType::U8),
        3 => Ok(DType::U32),
        4 => Ok(DType::I64),
        5 => Ok(DType::F16),
        6 => Ok(DType::BF16),
        _ => Err(Error::msg(format!("checkpoint: unknown dtype tag {v}"))),
    }
}

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64(w: &mut impl Write, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    Ok(read_array::<1>(r)?[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(r)?))
}

fn read_f64(r: &mut impl Read) -> Result<f64> {
    Ok(f64::from_le_bytes(read_array(r)?))
}

fn read_header(r: &mut impl Read, expected_version: u32) -> Result<()> {
    let magic = read_array::<4>(r)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!(
            "checkpoint: expected magic {MAGIC:?}, got {magic:?}"
        )));
    }
    let version = read_u32(r)?;
    if version != expected_version {
        return Err(Error::msg(format!(
            "checkpoint: unsupported version {version} (expected {expected_version})"
        )));
    }
    Ok(())
}

// Entries

fn write_entries<B: Backend>(w: &mut impl Write, state: &StateDict<B>) -> Result<()> {
    write_u32(w, state.len() as u32)?;
    for (key, tensor) in state.iter() {
        write_u32(w, key.len() as u32)?;
        w.write_all(key.as_bytes())?;
        w.write_all(&[dtype_to_u8(tensor.dtype())])?;

        let dims = tensor.dims();
        write_u32(w, dims.len() as u32)?;
        for &d in dims {
            write_u32(w, d as u32)?;
        }

        let data = tensor_to_bytes(tensor)?;
        write_u64(w, data.len() as u64)?;
        w.write_all(&data)?;
    }
    Ok(())
}

fn read_entries<B: Backend>(r: &mut impl Read, device: &B::Device) -> Result<StateDict<B>> {
    let count = read_u32(r)? as usize;
    let mut state = StateDict::new();
    for _ in 0..count {
        let key_len = read_u32(r)? as usize;
        let key = String::from_utf8(read_payload(r, key_len)?)
            .map_err(|e| Error::msg(format!("checkpoint: invalid UTF-8 key: {e}")))?;
        let dtype = u8_to_dtype(read_u8(r)?)?;

        let ndim = read_u32(r)?;
        let dims = (0..ndim)
            .map(|_| read_u32(r).map(|d| d as usize))
            .collect::<Result<Vec<_>>>()?;

        let data_len = usize::try_from(read_u64(r)?)
            .map_err(|_| Error::msg(format!("checkpoint: '{key}' payload does not fit in memory")))?;
        let data = read_payload(r, data_len)?;
        let tensor = tensor_from_bytes::<B>(&data, dims, dtype, device)
            .map_err(|e| Error::msg(format!("checkpoint: '{key}': {e}")))?;
        state.insert(key, tensor);
    }
    Ok(state)
}

// State dict files

/// Write a state dict to a writer in the native checkpoint format.
pub fn write_checkpoint<B: Backend>(writer: &mut impl Write, state: &StateDict<B>) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;
    write_entries(writer, state)
}

/// Read a state dict written by [`write_checkpoint`]. Tensors land on `device`.
pub fn read_checkpoint<B: Backend>(
    reader: &mut impl Read,
    device: &B::Device,
) -> Result<StateDict<B>> {
    read_header(reader, VERSION)?;
    read_entries(reader, device)
}

pub fn to_bytes<B: Backend>(state: &StateDict<B>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_checkpoint(&mut buf, state)?;
    Ok(buf)
}

pub fn from_bytes<B: Backend>(data: &[u8], device: &B::Device) -> Result<StateDict<B>> {
    read_checkpoint(&mut std::io::Cursor::new(data), device)
}

pub fn save_state_dict<B: Backend>(path: impl AsRef<Path>, state: &StateDict<B>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    write_checkpoint(&mut writer, state)?;
    writer.flush()?;
    info!("saved checkpoint with {} tensors to {}", state.len(), path.display());
    Ok(())
}

pub fn load_state_dict<B: Backend>(
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<StateDict<B>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let state = read_checkpoint(&mut reader, device)?;
    info!("loaded checkpoint with {} tensors from {}", state.len(), path.display());
    Ok(state)
}

/// Save a module's parameters and persistent buffers.
pub fn save_module<B: Backend, M: Module<B> + ?Sized>(
    path: impl AsRef<Path>,
    module: &M,
) -> Result<()> {
    save_state_dict(path, &module.state_dict())
}

/// Load a file written by [`save_module`] into `module`, in place.
///
/// Fails without touching the module if it has nothing registered, since
/// there is no device to decode onto.
pub fn load_module<B: Backend, M: Module<B> + ?Sized>(
    path: impl AsRef<Path>,
    module: &M,
    strict: bool,
) -> Result<LoadReport> {
    let device = module_device(module)?;
    let state = load_state_dict::<B>(path, &device)?;
    module.load_state_dict(&state, strict)
}

fn module_device<B: Backend, M: Module<B> + ?Sized>(module: &M) -> Result<B::Device> {
    module
        .named_slots()
        .first()
        .map(|(_, slot)| slot.tensor().device().clone())
        .ok_or_else(|| Error::msg("checkpoint: module has no registered tensors"))
}

// Training checkpoints

/// Model state plus the bookkeeping needed to resume a training run.
#[derive(Debug, Clone)]
pub struct TrainingCheckpoint<B: Backend> {
    pub model: StateDict<B>,
    /// Current training epoch (0-indexed).
    pub epoch: u64,
    pub global_step: u64,
    /// Best loss seen so far, `f64::INFINITY` before the first evaluation.
    pub best_loss: f64,
    pub loss_history: Vec<f64>,
}

impl<B: Backend> Default for TrainingCheckpoint<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> TrainingCheckpoint<B> {
    pub fn new() -> Self {
        TrainingCheckpoint {
            model: StateDict::new(),
            epoch: 0,
            global_step: 0,
            best_loss: f64::INFINITY,
            loss_history: Vec::new(),
        }
    }

    /// Snapshot of `module.state_dict()`, buffers included.
    ///
    /// Entries are copied into fresh storage, so training that keeps
    /// running before the checkpoint is saved does not change it.
    pub fn from_module<M: Module<B> + ?Sized>(module: &M) -> Result<Self> {
        Ok(TrainingCheckpoint {
            model: module.state_dict().snapshot()?,
            ..Self::new()
        })
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_global_step(mut self, step: u64) -> Self {
        self.global_step = step;
        self
    }

    pub fn with_best_loss(mut self, loss: f64) -> Self {
        self.best_loss = loss;
        self
    }

    pub fn with_loss_history(mut self, history: Vec<f64>) -> Self {
        self.loss_history = history;
        self
    }

    /// Restore the saved model state into `module`.
    pub fn restore<M: Module<B> + ?Sized>(&self, module: &M, strict: bool) -> Result<LoadReport> {
        module.load_state_dict(&self.model, strict)
    }
}

pub fn write_training_checkpoint<B: Backend>(
    writer: &mut impl Write,
    checkpoint: &TrainingCheckpoint<B>,
) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, TRAINING_VERSION)?;

    writer.write_all(&[TAG_MODEL])?;
    write_entries(writer, &checkpoint.model)?;

    writer.write_all(&[TAG_METADATA])?;
    write_u64(writer, checkpoint.epoch)?;
    write_u64(writer, checkpoint.global_step)?;
    writer.write_all(&checkpoint.best_loss.to_le_bytes())?;
    write_u32(writer, checkpoint.loss_history.len() as u32)?;
    for &loss in &checkpoint.loss_history {
        writer.write_all(&loss.to_le_bytes())?;
    }

    writer.write_all(&[TAG_EOF])?;
    Ok(())
}

pub fn read_training_checkpoint<B: Backend>(
    reader: &mut impl Read,
    device: &B::Device,
) -> Result<TrainingCheckpoint<B>> {
    read_header(reader, TRAINING_VERSION)?;

    let mut checkpoint = TrainingCheckpoint::new();
    loop {
        match read_u8(reader)? {
            TAG_MODEL => checkpoint.model = read_entries(reader, device)?,
            TAG_METADATA => {
                checkpoint.epoch = read_u64(reader)?;
                checkpoint.global_step = read_u64(reader)?;
                checkpoint.best_loss = read_f64(reader)?;
                let n = read_u32(reader)? as usize;
                checkpoint.loss_history = (0..n)
                    .map(|_| read_f64(reader))
                    .collect::<Result<Vec<_>>>()?;
            }
            TAG_EOF => break,
            other => {
                return Err(Error::msg(format!(
                    "checkpoint: unknown section tag 0x{other:02X}"
                )))
            }
        }
    }
    Ok(checkpoint)
}

/// Save a complete training checkpoint to a file.
///
/// ```rust,no_run
/// use vole::checkpoint::{self, TrainingCheckpoint};
/// use vole::prelude::*;
///
/// let ckpt = TrainingCheckpoint::<CpuBackend>::new()
///     .with_epoch(10)
///     .with_global_step(5000)
///     .with_best_loss(0.032)
///     .with_loss_history(vec![0.5, 0.2, 0.1, 0.05, 0.032]);
/// checkpoint::save_training("training.vole", &ckpt).unwrap();
/// ```
pub fn save_training<B: Backend>(
    path: impl AsRef<Path>,
    checkpoint: &TrainingCheckpoint<B>,
) -> Result<()> {
    let path = path.as_ref();
    let mut writer = BufWriter::new(File::create(path)?);
    write_training_checkpoint(&mut writer, checkpoint)?;
    writer.flush()?;
    info!(
        "saved training checkpoint (epoch {}, step {}) to {}",
        checkpoint.epoch,
        checkpoint.global_step,
        path.display()
    );
    Ok(())
}

pub fn load_training<B: Backend>(
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<TrainingCheckpoint<B>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let checkpoint = read_training_checkpoint(&mut reader, device)?;
    info!(
        "loaded training checkpoint (epoch {}, step {}) from {}",
        checkpoint.epoch,
        checkpoint.global_step,
        path.display()
    );
    Ok(checkpoint)
}

pub fn training_to_bytes<B: Backend>(checkpoint: &TrainingCheckpoint<B>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_training_checkpoint(&mut buf, checkpoint)?;
    Ok(buf)
}

pub fn training_from_bytes<B: Backend>(
    data: &[u8],
    device: &B::Device,
) -> Result<TrainingCheckpoint<B>> {
    read_training_checkpoint(&mut std::io::Cursor::new(data), device)
}
