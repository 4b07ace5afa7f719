//! Flat parameter maps and their binary NDArray-list encoding.
//!
//! Layout (little-endian):
//! - `u64` list magic `0x112`, `u64` reserved
//! - `u64` array count, then each array
//! - `u64` name count, then each name as `u64` length + utf-8 bytes (`arg:` or `aux:` prefixed)
//!
//! An array starts with a `u32` magic. `V2`/`V3` are followed by an `i32` storage type, `V1`
//! is not. Both then hold the shape as `i32` ndim + `i64` dims. Any other magic is the ndim
//! of a legacy array, followed by `u32` dims. Arrays with data continue with the context
//! (`i32` device type, `i32` device id), an `i32` element type flag and the raw data.
//!
//! A negative ndim marks an array without data. Zero dims does too, except under `V3`
//! where it is a scalar.

use crate::error::CheckpointError;
use crate::symbol::ParamKind;
use burn::tensor::{DType, TensorData, f16};
use num_traits::ToPrimitive;
use std::collections::BTreeMap;
use std::io::{Read, Write};

const LIST_MAGIC: u64 = 0x112;
const ARRAY_V1_MAGIC: u32 = 0xF993_FAC8;
const ARRAY_V2_MAGIC: u32 = 0xF993_FAC9;
const ARRAY_V3_MAGIC: u32 = 0xF993_FACA;
const DENSE_STORAGE: i32 = 0;
const CPU_DEVICE: i32 = 1;

/// Element type flags.
mod flag {
    pub const F32: i32 = 0;
    pub const F64: i32 = 1;
    pub const F16: i32 = 2;
    pub const U8: i32 = 3;
    pub const I32: i32 = 4;
    pub const I8: i32 = 5;
    pub const I64: i32 = 6;
}

/// Name to tensor mapping, split into learned arguments and auxiliary states.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    pub args: BTreeMap<String, TensorData>,
    pub auxs: BTreeMap<String, TensorData>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ParamKind, name: &str) -> Option<&TensorData> {
        self.map(kind).get(name)
    }

    pub(crate) fn map_entry(&self, kind: ParamKind, name: &str) -> Option<(&str, &TensorData)> {
        self.map(kind)
            .get_key_value(name)
            .map(|(key, data)| (key.as_str(), data))
    }

    pub fn insert(&mut self, kind: ParamKind, name: impl Into<String>, data: TensorData) {
        let map = match kind {
            ParamKind::Arg => &mut self.args,
            ParamKind::Aux => &mut self.auxs,
        };
        map.insert(name.into(), data);
    }

    pub fn len(&self) -> usize {
        self.args.len() + self.auxs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.auxs.is_empty()
    }

    /// All entries as `(kind, name, data)`, arguments first.
    pub fn iter(&self) -> impl Iterator<Item = (ParamKind, &str, &TensorData)> {
        let args = self.args.iter().map(|(k, v)| (ParamKind::Arg, k.as_str(), v));
        let auxs = self.auxs.iter().map(|(k, v)| (ParamKind::Aux, k.as_str(), v));
        args.chain(auxs)
    }

    fn map(&self, kind: ParamKind) -> &BTreeMap<String, TensorData> {
        match kind {
            ParamKind::Arg => &self.args,
            ParamKind::Aux => &self.auxs,
        }
    }

    /// Decodes an NDArray list.
    pub fn read_from(mut reader: impl Read) -> Result<Self, CheckpointError> {
        let r = &mut reader;
        let magic = read_u64(r)?;
        if magic != LIST_MAGIC {
            return Err(CheckpointError::ListMagic(magic));
        }
        let _reserved = read_u64(r)?;

        let count = read_len(r)?;
        let mut arrays = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            arrays.push(read_array(r)?);
        }

        let names = read_len(r)?;
        if names != arrays.len() {
            return Err(CheckpointError::NameCount {
                arrays: arrays.len(),
                names,
            });
        }
        let mut params = Self::new();
        for data in arrays {
            let len = read_len(r)?;
            let bytes = read_vec(r, len)?;
            let name = String::from_utf8(bytes).map_err(CheckpointError::NameEncoding)?;
            let (kind, key) = split_prefix(&name)?;
            params.insert(kind, key, data);
        }
        Ok(params)
    }

    /// Encodes every entry as a dense `V2` float32 array.
    pub fn write_to(&self, mut writer: impl Write) -> Result<(), std::io::Error> {
        let w = &mut writer;
        w.write_all(&LIST_MAGIC.to_le_bytes())?;
        w.write_all(&0u64.to_le_bytes())?;

        w.write_all(&(self.len() as u64).to_le_bytes())?;
        for (_, _, data) in self.iter() {
            write_array(w, data)?;
        }

        w.write_all(&(self.len() as u64).to_le_bytes())?;
        for (kind, name, _) in self.iter() {
            let full = format!("{}:{name}", kind.prefix());
            w.write_all(&(full.len() as u64).to_le_bytes())?;
            w.write_all(full.as_bytes())?;
        }
        Ok(())
    }

    /// Units per stage, inferred from `stage{i}_unit{j}_*` names.
    ///
    /// Stages without any unit parameter count as zero.
    pub fn stage_units(&self) -> Vec<usize> {
        let mut units: Vec<usize> = Vec::new();
        for (_, name, _) in self.iter() {
            let Some((stage, unit)) = parse_unit(name) else {
                continue;
            };
            if units.len() < stage {
                units.resize(stage, 0);
            }
            units[stage - 1] = units[stage - 1].max(unit);
        }
        units
    }
}

/// `stage3_unit12_conv1_weight` -> `(3, 12)`.
fn parse_unit(name: &str) -> Option<(usize, usize)> {
    let rest = name.strip_prefix("stage")?;
    let (stage, rest) = rest.split_once('_')?;
    let rest = rest.strip_prefix("unit")?;
    let (unit, _) = rest.split_once('_')?;
    let stage: usize = stage.parse().ok()?;
    let unit: usize = unit.parse().ok()?;
    (stage > 0 && unit > 0).then_some((stage, unit))
}

fn split_prefix(name: &str) -> Result<(ParamKind, &str), CheckpointError> {
    if let Some(key) = name.strip_prefix("arg:") {
        Ok((ParamKind::Arg, key))
    } else if let Some(key) = name.strip_prefix("aux:") {
        Ok((ParamKind::Aux, key))
    } else {
        Err(CheckpointError::NamePrefix(name.to_string()))
    }
}

fn read_bytes<const N: usize>(r: &mut impl Read) -> Result<[u8; N], CheckpointError> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(CheckpointError::Truncated)?;
    Ok(buf)
}

/// Reads exactly `len` bytes, growing the buffer with the data actually present.
fn read_vec(r: &mut impl Read, len: usize) -> Result<Vec<u8>, CheckpointError> {
    let mut bytes = Vec::new();
    r.by_ref()
        .take(len as u64)
        .read_to_end(&mut bytes)
        .map_err(CheckpointError::Truncated)?;
    if bytes.len() != len {
        return Err(CheckpointError::Truncated(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", bytes.len()),
        )));
    }
    Ok(bytes)
}

fn read_u64(r: &mut impl Read) -> Result<u64, CheckpointError> {
    read_bytes(r).map(u64::from_le_bytes)
}

fn read_u32(r: &mut impl Read) -> Result<u32, CheckpointError> {
    read_bytes(r).map(u32::from_le_bytes)
}

fn read_i32(r: &mut impl Read) -> Result<i32, CheckpointError> {
    read_bytes(r).map(i32::from_le_bytes)
}

fn read_i64(r: &mut impl Read) -> Result<i64, CheckpointError> {
    read_bytes(r).map(i64::from_le_bytes)
}

fn read_len(r: &mut impl Read) -> Result<usize, CheckpointError> {
    let len = read_u64(r)?;
    len.to_usize()
        .ok_or(CheckpointError::Dimension(len.to_i64().unwrap_or(i64::MAX)))
}

/// `i32` ndim followed by `i64` dims, `None` for an array without data.
///
/// A negative ndim always means no data. With `scalars`, zero dims is a scalar; otherwise
/// it also means no data.
fn read_shape(r: &mut impl Read, scalars: bool) -> Result<Option<Vec<usize>>, CheckpointError> {
    let ndim = read_i32(r)?;
    let Some(ndim) = ndim.to_usize().filter(|&n| scalars || n > 0) else {
        return Ok(None);
    };
    (0..ndim)
        .map(|_| {
            let dim = read_i64(r)?;
            dim.to_usize().ok_or(CheckpointError::Dimension(dim))
        })
        .collect::<Result<_, _>>()
        .map(Some)
}

fn read_legacy_shape(r: &mut impl Read, ndim: u32) -> Result<Option<Vec<usize>>, CheckpointError> {
    if ndim == 0 {
        return Ok(None);
    }
    (0..ndim)
        .map(|_| read_u32(r).map(|dim| dim as usize))
        .collect::<Result<_, _>>()
        .map(Some)
}

fn read_array(r: &mut impl Read) -> Result<TensorData, CheckpointError> {
    let magic = read_u32(r)?;
    let shape = match magic {
        ARRAY_V2_MAGIC | ARRAY_V3_MAGIC => {
            let storage = read_i32(r)?;
            if storage != DENSE_STORAGE {
                return Err(CheckpointError::StorageType(storage));
            }
            read_shape(r, magic == ARRAY_V3_MAGIC)?
        }
        ARRAY_V1_MAGIC => read_shape(r, false)?,
        ndim => read_legacy_shape(r, ndim)?,
    };
    let Some(shape) = shape else {
        return Ok(TensorData::new(Vec::<f32>::new(), [0]));
    };

    let _device_type = read_i32(r)?;
    let _device_id = read_i32(r)?;
    let type_flag = read_i32(r)?;

    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or(CheckpointError::Dimension(i64::MAX))?;
    let elem_size = match type_flag {
        flag::F32 | flag::I32 => 4,
        flag::F64 | flag::I64 => 8,
        flag::F16 => 2,
        flag::U8 | flag::I8 => 1,
        other => return Err(CheckpointError::TypeFlag(other)),
    };
    let len = numel
        .checked_mul(elem_size)
        .ok_or(CheckpointError::Dimension(i64::MAX))?;
    let bytes = read_vec(r, len)?;

    let data = match type_flag {
        flag::F32 => TensorData::new(bytemuck::pod_collect_to_vec::<u8, f32>(&bytes), shape),
        flag::F64 => TensorData::new(bytemuck::pod_collect_to_vec::<u8, f64>(&bytes), shape),
        flag::F16 => {
            let bits = bytemuck::pod_collect_to_vec::<u8, u16>(&bytes);
            let values: Vec<f16> = bits.into_iter().map(f16::from_bits).collect();
            TensorData::new(values, shape)
        }
        flag::U8 => TensorData::new(bytes, shape),
        flag::I32 => TensorData::new(bytemuck::pod_collect_to_vec::<u8, i32>(&bytes), shape),
        flag::I8 => TensorData::new(bytemuck::pod_collect_to_vec::<u8, i8>(&bytes), shape),
        flag::I64 => TensorData::new(bytemuck::pod_collect_to_vec::<u8, i64>(&bytes), shape),
        other => return Err(CheckpointError::TypeFlag(other)),
    };
    Ok(data)
}

/// Scalars need `V3`, where zero dims do not mean "no data".
fn write_array(w: &mut impl Write, data: &TensorData) -> Result<(), std::io::Error> {
    let magic = if data.shape.is_empty() {
        ARRAY_V3_MAGIC
    } else {
        ARRAY_V2_MAGIC
    };
    w.write_all(&magic.to_le_bytes())?;
    w.write_all(&DENSE_STORAGE.to_le_bytes())?;
    w.write_all(&(data.shape.len() as i32).to_le_bytes())?;
    for &dim in &data.shape {
        w.write_all(&(dim as i64).to_le_bytes())?;
    }
    w.write_all(&CPU_DEVICE.to_le_bytes())?;
    w.write_all(&0i32.to_le_bytes())?;
    w.write_all(&flag::F32.to_le_bytes())?;

    let values: Vec<f32> = match data.dtype {
        DType::F32 => data.to_vec::<f32>(),
        _ => data.clone().convert::<f32>().to_vec::<f32>(),
    }
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{e:?}")))?;
    w.write_all(bytemuck::cast_slice(&values))
}
