//! Self-describing wire framing for [`Value`]s.
//!
//! Every value is one frame: a type-tag word, then a payload. Composites
//! are a length word followed by that many recursively framed values. A
//! tensor is rank, dimension sizes, an element-type tag, then the raw
//! contiguous little-endian element buffer. The receiver needs no prior
//! knowledge of the structure to reconstruct it.

use std::collections::BTreeSet;

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use crate::error::{PipelineError, Result};
use crate::value::Value;

const TAG_TENSOR: u64 = 100;
const TAG_TUPLE: u64 = 101;
const TAG_LIST: u64 = 102;
const TAG_SHAPE: u64 = 103;
const TAG_INT: u64 = 104;
const TAG_SET: u64 = 105;

/// Element-type ids. The full table is carried on the wire even though the
/// complex and narrow-integer entries have no tensor representation here;
/// decoding one of those fails with an encoding error instead of guessing.
fn dtype_code(dtype: DType) -> Result<u64> {
    match dtype {
        DType::F32 => Ok(0),
        DType::F64 => Ok(1),
        DType::F16 => Ok(4),
        DType::BF16 => Ok(5),
        DType::U8 => Ok(6),
        DType::I64 => Ok(10),
        DType::U32 => Ok(12),
        other => Err(PipelineError::Encoding(format!(
            "tensor dtype {other:?} has no wire representation"
        ))),
    }
}

fn code_dtype(code: u64) -> Result<DType> {
    match code {
        0 => Ok(DType::F32),
        1 => Ok(DType::F64),
        4 => Ok(DType::F16),
        5 => Ok(DType::BF16),
        6 => Ok(DType::U8),
        10 => Ok(DType::I64),
        12 => Ok(DType::U32),
        2 | 3 | 7 | 8 | 9 | 11 => Err(PipelineError::Encoding(format!(
            "element-type id {code} is not supported by this tensor backend"
        ))),
        other => Err(PipelineError::Encoding(format!(
            "unknown element-type id {other}"
        ))),
    }
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf)?;
    Ok(buf)
}

pub fn decode_value(frame: &[u8]) -> Result<Value> {
    let mut reader = FrameReader { frame, pos: 0 };
    let value = decode_from(&mut reader)?;
    if reader.pos != frame.len() {
        return Err(PipelineError::Encoding(format!(
            "{} trailing bytes after a complete value",
            frame.len() - reader.pos
        )));
    }
    Ok(value)
}

fn put_word(buf: &mut Vec<u8>, word: u64) {
    buf.extend_from_slice(&word.to_le_bytes());
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Tensor(t) => {
            put_word(buf, TAG_TENSOR);
            encode_tensor(t, buf)
        }
        Value::Tuple(vs) => {
            put_word(buf, TAG_TUPLE);
            encode_seq(vs, buf)
        }
        Value::List(vs) => {
            put_word(buf, TAG_LIST);
            encode_seq(vs, buf)
        }
        Value::Shape(dims) => {
            put_word(buf, TAG_SHAPE);
            put_word(buf, dims.len() as u64);
            for &d in dims {
                put_word(buf, TAG_INT);
                put_word(buf, d as u64);
            }
            Ok(())
        }
        Value::Int(i) => {
            put_word(buf, TAG_INT);
            put_word(buf, *i as u64);
            Ok(())
        }
        Value::Set(s) => {
            put_word(buf, TAG_SET);
            put_word(buf, s.len() as u64);
            for &i in s {
                put_word(buf, TAG_INT);
                put_word(buf, i as u64);
            }
            Ok(())
        }
    }
}

fn encode_seq(vs: &[Value], buf: &mut Vec<u8>) -> Result<()> {
    put_word(buf, vs.len() as u64);
    for v in vs {
        encode_into(v, buf)?;
    }
    Ok(())
}

fn encode_tensor(t: &Tensor, buf: &mut Vec<u8>) -> Result<()> {
    // A strided view cannot be shipped as a flat buffer.
    let t = if t.is_contiguous() { t.clone() } else { t.contiguous()? };

    put_word(buf, t.rank() as u64);
    for &d in t.dims() {
        put_word(buf, d as u64);
    }
    put_word(buf, dtype_code(t.dtype())?);

    let flat = t.flatten_all()?;
    match t.dtype() {
        DType::F32 => {
            for x in flat.to_vec1::<f32>()? {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        DType::F64 => {
            for x in flat.to_vec1::<f64>()? {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        DType::F16 => {
            for x in flat.to_vec1::<f16>()? {
                buf.extend_from_slice(&x.to_bits().to_le_bytes());
            }
        }
        DType::BF16 => {
            for x in flat.to_vec1::<bf16>()? {
                buf.extend_from_slice(&x.to_bits().to_le_bytes());
            }
        }
        DType::U8 => buf.extend_from_slice(&flat.to_vec1::<u8>()?),
        DType::I64 => {
            for x in flat.to_vec1::<i64>()? {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        DType::U32 => {
            for x in flat.to_vec1::<u32>()? {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        other => {
            return Err(PipelineError::Encoding(format!(
                "tensor dtype {other:?} has no wire representation"
            )))
        }
    }
    Ok(())
}

struct FrameReader<'a> {
    frame: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn word(&mut self) -> Result<u64> {
        let bytes = self.bytes(8)?;
        let arr: [u8; 8] = bytes.try_into().expect("8-byte slice");
        Ok(u64::from_le_bytes(arr))
    }

    fn int_word(&mut self) -> Result<i64> {
        Ok(self.word()? as i64)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.frame.len() {
            return Err(PipelineError::Encoding(format!(
                "frame truncated: wanted {n} bytes at offset {}, frame is {} bytes",
                self.pos,
                self.frame.len()
            )));
        }
        let out = &self.frame[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

fn decode_from(r: &mut FrameReader) -> Result<Value> {
    match r.word()? {
        TAG_TENSOR => decode_tensor(r),
        TAG_TUPLE => Ok(Value::Tuple(decode_seq(r)?)),
        TAG_LIST => Ok(Value::List(decode_seq(r)?)),
        TAG_SHAPE => {
            let dims = decode_seq(r)?
                .into_iter()
                .map(|v| match v {
                    Value::Int(i) if i >= 0 => Ok(i as usize),
                    other => Err(PipelineError::Encoding(format!(
                        "shape element {other:?} is not a non-negative integer"
                    ))),
                })
                .collect::<Result<Vec<usize>>>()?;
            Ok(Value::Shape(dims))
        }
        TAG_INT => Ok(Value::Int(r.int_word()?)),
        // A set is framed as a list; duplicate semantics beyond membership
        // are discarded on arrival.
        TAG_SET => {
            let mut set = BTreeSet::new();
            for v in decode_seq(r)? {
                match v {
                    Value::Int(i) => {
                        set.insert(i);
                    }
                    other => {
                        return Err(PipelineError::Encoding(format!(
                            "set element {other:?} is not an integer"
                        )))
                    }
                }
            }
            Ok(Value::Set(set))
        }
        other => Err(PipelineError::Encoding(format!("unknown type tag {other}"))),
    }
}

fn decode_seq(r: &mut FrameReader) -> Result<Vec<Value>> {
    let len = r.word()? as usize;
    let mut out = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        out.push(decode_from(r)?);
    }
    Ok(out)
}

fn decode_tensor(r: &mut FrameReader) -> Result<Value> {
    let rank = r.word()? as usize;
    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        dims.push(r.word()? as usize);
    }
    let dtype = code_dtype(r.word()?)?;
    let elems: usize = dims.iter().product();
    let raw = r.bytes(elems * dtype.size_in_bytes())?;

    let device = Device::Cpu;
    let tensor = match dtype {
        DType::F32 => {
            let data: Vec<f32> = raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().expect("4-byte chunk")))
                .collect();
            Tensor::from_vec(data, dims, &device)?
        }
        DType::F64 => {
            let data: Vec<f64> = raw
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                .collect();
            Tensor::from_vec(data, dims, &device)?
        }
        DType::F16 => {
            let data: Vec<f16> = raw
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes(c.try_into().expect("2-byte chunk"))))
                .collect();
            Tensor::from_vec(data, dims, &device)?
        }
        DType::BF16 => {
            let data: Vec<bf16> = raw
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes(c.try_into().expect("2-byte chunk"))))
                .collect();
            Tensor::from_vec(data, dims, &device)?
        }
        DType::U8 => Tensor::from_vec(raw.to_vec(), dims, &device)?,
        DType::I64 => {
            let data: Vec<i64> = raw
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                .collect();
            Tensor::from_vec(data, dims, &device)?
        }
        DType::U32 => {
            let data: Vec<u32> = raw
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().expect("4-byte chunk")))
                .collect();
            Tensor::from_vec(data, dims, &device)?
        }
        other => {
            return Err(PipelineError::Encoding(format!(
                "element-type {other:?} cannot be materialized"
            )))
        }
    };
    Ok(Value::Tensor(tensor))
}
