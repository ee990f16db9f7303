//! Named tensors exchanged with the serving host.
//!
//! Element types follow the Triton naming scheme: model configs spell them
//! `TYPE_FP32`, `TYPE_STRING`, ... while the inference protocol uses `FP32`,
//! `BYTES`, ... . Raw wire contents are little-endian; BYTES elements are each
//! prefixed by a 4-byte little-endian length.

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{PreprocessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp32,
    Fp64,
    Bytes,
}

impl DataType {
    /// Resolves a model-config type name such as `TYPE_FP32`.
    pub fn from_config_name(name: &str) -> Result<Self> {
        let data_type = match name {
            "TYPE_BOOL" => Self::Bool,
            "TYPE_UINT8" => Self::Uint8,
            "TYPE_UINT16" => Self::Uint16,
            "TYPE_UINT32" => Self::Uint32,
            "TYPE_UINT64" => Self::Uint64,
            "TYPE_INT8" => Self::Int8,
            "TYPE_INT16" => Self::Int16,
            "TYPE_INT32" => Self::Int32,
            "TYPE_INT64" => Self::Int64,
            "TYPE_FP32" => Self::Fp32,
            "TYPE_FP64" => Self::Fp64,
            "TYPE_STRING" => Self::Bytes,
            "TYPE_FP16" | "TYPE_BF16" => {
                return Err(PreprocessError::Configuration(format!(
                    "data type {name} is not supported by this model"
                )))
            }
            other => {
                return Err(PreprocessError::Configuration(format!(
                    "unknown data type {other}"
                )))
            }
        };
        Ok(data_type)
    }

    /// Resolves a protocol type name such as `FP32`.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        let data_type = match name {
            "BOOL" => Self::Bool,
            "UINT8" => Self::Uint8,
            "UINT16" => Self::Uint16,
            "UINT32" => Self::Uint32,
            "UINT64" => Self::Uint64,
            "INT8" => Self::Int8,
            "INT16" => Self::Int16,
            "INT32" => Self::Int32,
            "INT64" => Self::Int64,
            "FP32" => Self::Fp32,
            "FP64" => Self::Fp64,
            "BYTES" => Self::Bytes,
            _ => return None,
        };
        Some(data_type)
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::Uint8 => "UINT8",
            Self::Uint16 => "UINT16",
            Self::Uint32 => "UINT32",
            Self::Uint64 => "UINT64",
            Self::Int8 => "INT8",
            Self::Int16 => "INT16",
            Self::Int32 => "INT32",
            Self::Int64 => "INT64",
            Self::Fp32 => "FP32",
            Self::Fp64 => "FP64",
            Self::Bytes => "BYTES",
        }
    }

    /// Size of one element in raw contents, `None` for variable-length BYTES.
    pub fn element_size(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint16 | Self::Int16 => Some(2),
            Self::Uint32 | Self::Int32 | Self::Fp32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Fp64 => Some(8),
            Self::Bytes => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(Vec<bool>),
    Uint8(Vec<u8>),
    Uint16(Vec<u16>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Fp32(Vec<f32>),
    Fp64(Vec<f64>),
    Bytes(Vec<Vec<u8>>),
}

impl TensorData {
    /// Casts a stream of values into `data_type`.
    ///
    /// Integer targets truncate toward zero and saturate at the type bounds.
    /// BYTES targets receive the decimal rendering of each value.
    pub fn cast<I>(data_type: DataType, values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let values = values.into_iter();
        match data_type {
            DataType::Bool => Self::Bool(values.map(|v| v != 0.0).collect()),
            DataType::Uint8 => Self::Uint8(values.map(|v| v as u8).collect()),
            DataType::Uint16 => Self::Uint16(values.map(|v| v as u16).collect()),
            DataType::Uint32 => Self::Uint32(values.map(|v| v as u32).collect()),
            DataType::Uint64 => Self::Uint64(values.map(|v| v as u64).collect()),
            DataType::Int8 => Self::Int8(values.map(|v| v as i8).collect()),
            DataType::Int16 => Self::Int16(values.map(|v| v as i16).collect()),
            DataType::Int32 => Self::Int32(values.map(|v| v as i32).collect()),
            DataType::Int64 => Self::Int64(values.map(|v| v as i64).collect()),
            DataType::Fp32 => Self::Fp32(values.map(|v| v as f32).collect()),
            DataType::Fp64 => Self::Fp64(values.collect()),
            DataType::Bytes => Self::Bytes(values.map(|v| v.to_string().into_bytes()).collect()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Uint8(_) => DataType::Uint8,
            Self::Uint16(_) => DataType::Uint16,
            Self::Uint32(_) => DataType::Uint32,
            Self::Uint64(_) => DataType::Uint64,
            Self::Int8(_) => DataType::Int8,
            Self::Int16(_) => DataType::Int16,
            Self::Int32(_) => DataType::Int32,
            Self::Int64(_) => DataType::Int64,
            Self::Fp32(_) => DataType::Fp32,
            Self::Fp64(_) => DataType::Fp64,
            Self::Bytes(_) => DataType::Bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Uint8(v) => v.len(),
            Self::Uint16(v) => v.len(),
            Self::Uint32(v) => v.len(),
            Self::Uint64(v) => v.len(),
            Self::Int8(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Fp32(v) => v.len(),
            Self::Fp64(v) => v.len(),
            Self::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the elements in the raw little-endian wire layout.
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bool(v) => v.iter().map(|&b| u8::from(b)).collect(),
            Self::Uint8(v) => v.clone(),
            Self::Int8(v) => v.iter().map(|&x| x as u8).collect(),
            Self::Uint16(v) => write_le(v.len() * 2, |buf| LittleEndian::write_u16_into(v, buf)),
            Self::Int16(v) => write_le(v.len() * 2, |buf| LittleEndian::write_i16_into(v, buf)),
            Self::Uint32(v) => write_le(v.len() * 4, |buf| LittleEndian::write_u32_into(v, buf)),
            Self::Int32(v) => write_le(v.len() * 4, |buf| LittleEndian::write_i32_into(v, buf)),
            Self::Fp32(v) => write_le(v.len() * 4, |buf| LittleEndian::write_f32_into(v, buf)),
            Self::Uint64(v) => write_le(v.len() * 8, |buf| LittleEndian::write_u64_into(v, buf)),
            Self::Int64(v) => write_le(v.len() * 8, |buf| LittleEndian::write_i64_into(v, buf)),
            Self::Fp64(v) => write_le(v.len() * 8, |buf| LittleEndian::write_f64_into(v, buf)),
            Self::Bytes(v) => {
                let total = v.iter().map(|item| item.len() + 4).sum();
                let mut out = Vec::with_capacity(total);
                for item in v {
                    // Writing into a Vec cannot fail.
                    let _ = out.write_u32::<LittleEndian>(item.len() as u32);
                    out.extend_from_slice(item);
                }
                out
            }
        }
    }

    /// Parses raw little-endian wire contents of the given type.
    pub fn from_raw_bytes(data_type: DataType, raw: &[u8]) -> std::result::Result<Self, String> {
        if let Some(size) = data_type.element_size() {
            if raw.len() % size != 0 {
                return Err(format!(
                    "{} raw bytes is not a multiple of the {data_type} element size {size}",
                    raw.len()
                ));
            }
        }
        let count = data_type.element_size().map(|size| raw.len() / size).unwrap_or(0);
        let data = match data_type {
            DataType::Bool => Self::Bool(raw.iter().map(|&b| b != 0).collect()),
            DataType::Uint8 => Self::Uint8(raw.to_vec()),
            DataType::Int8 => Self::Int8(raw.iter().map(|&b| b as i8).collect()),
            DataType::Uint16 => Self::Uint16(read_le(raw, count, LittleEndian::read_u16_into)),
            DataType::Int16 => Self::Int16(read_le(raw, count, LittleEndian::read_i16_into)),
            DataType::Uint32 => Self::Uint32(read_le(raw, count, LittleEndian::read_u32_into)),
            DataType::Int32 => Self::Int32(read_le(raw, count, LittleEndian::read_i32_into)),
            DataType::Fp32 => Self::Fp32(read_le(raw, count, LittleEndian::read_f32_into)),
            DataType::Uint64 => Self::Uint64(read_le(raw, count, LittleEndian::read_u64_into)),
            DataType::Int64 => Self::Int64(read_le(raw, count, LittleEndian::read_i64_into)),
            DataType::Fp64 => Self::Fp64(read_le(raw, count, LittleEndian::read_f64_into)),
            DataType::Bytes => Self::Bytes(read_length_prefixed(raw)?),
        };
        Ok(data)
    }
}

fn write_le(len: usize, write: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let mut out = vec![0u8; len];
    write(&mut out);
    out
}

fn read_le<T: Default + Clone>(raw: &[u8], count: usize, read: fn(&[u8], &mut [T])) -> Vec<T> {
    let mut out = vec![T::default(); count];
    read(raw, &mut out);
    out
}

fn read_length_prefixed(raw: &[u8]) -> std::result::Result<Vec<Vec<u8>>, String> {
    let mut cursor = Cursor::new(raw);
    let mut items = Vec::new();
    while (cursor.position() as usize) < raw.len() {
        let len = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| format!("truncated length prefix at byte {}", cursor.position()))?;
        let remaining = raw.len() - cursor.position() as usize;
        if len as usize > remaining {
            return Err(format!(
                "element {} declares {len} bytes but the buffer ends early",
                items.len()
            ));
        }
        let mut item = vec![0u8; len as usize];
        cursor.read_exact(&mut item).map_err(|_| {
            format!("element {} declares {len} bytes but the buffer ends early", items.len())
        })?;
        items.push(item);
    }
    Ok(items)
}

/// A named tensor with a row-major shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: TensorData,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<i64>, data: TensorData) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }

    /// Builds a `(batch, 1)` BYTES tensor, the layout hosts use for encoded images.
    pub fn from_blobs(name: impl Into<String>, blobs: Vec<Vec<u8>>) -> Self {
        let batch = blobs.len() as i64;
        Self::new(name, vec![batch, 1], TensorData::Bytes(blobs))
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    /// Number of elements implied by the shape, `None` for a negative
    /// dimension or a product that overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |count, &dim| {
            let dim = usize::try_from(dim).ok()?;
            count.checked_mul(dim)
        })
    }

    /// Checks that the shape describes exactly the elements carried.
    pub fn check_shape(&self) -> Result<()> {
        match self.element_count() {
            Some(count) if count == self.data.len() => Ok(()),
            _ => Err(PreprocessError::MalformedTensor {
                name: self.name.clone(),
                reason: format!(
                    "shape {:?} does not match {} elements",
                    self.shape,
                    self.data.len()
                ),
            }),
        }
    }
}
