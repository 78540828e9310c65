//! Values that live in a [`Space`](super::Space).
//!
//! A [`Tensor`] is a flat, row-major buffer of one element type plus a shape.
//! A [`Value`] is either a tensor or a named aggregate of values. Batched values
//! carry the episode index as their leading dimension, and the helpers here
//! (`slice`, `concat`, `stack`, `row`) all operate along that dimension.

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::DType;
use crate::core::{EnvError, Result};

/// Typed element storage for a [`Tensor`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
    U8(Vec<u8>),
}

// Runs `$body` with `$v` bound to the inner vector, whatever its element type.
macro_rules! visit {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::F32($v) => $body,
            TensorData::F64($v) => $body,
            TensorData::I32($v) => $body,
            TensorData::I64($v) => $body,
            TensorData::Bool($v) => $body,
            TensorData::U8($v) => $body,
        }
    };
}

// Like `visit!`, but rewraps the resulting vector in the same variant.
macro_rules! map_same {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            TensorData::F32($v) => TensorData::F32($body),
            TensorData::F64($v) => TensorData::F64($body),
            TensorData::I32($v) => TensorData::I32($body),
            TensorData::I64($v) => TensorData::I64($body),
            TensorData::Bool($v) => TensorData::Bool($body),
            TensorData::U8($v) => TensorData::U8($body),
        }
    };
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::Bool(_) => DType::Bool,
            TensorData::U8(_) => DType::U8,
        }
    }

    pub fn len(&self) -> usize {
        visit!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `n` zero elements of the given type.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; n]),
            DType::F64 => TensorData::F64(vec![0.0; n]),
            DType::I32 => TensorData::I32(vec![0; n]),
            DType::I64 => TensorData::I64(vec![0; n]),
            DType::Bool => TensorData::Bool(vec![false; n]),
            DType::U8 => TensorData::U8(vec![0; n]),
        }
    }

    /// Element `i` widened to f64, used for bounds checks.
    pub fn get_f64(&self, i: usize) -> f64 {
        match self {
            TensorData::F32(v) => v[i] as f64,
            TensorData::F64(v) => v[i],
            TensorData::I32(v) => v[i] as f64,
            TensorData::I64(v) => v[i] as f64,
            TensorData::Bool(v) => v[i] as u8 as f64,
            TensorData::U8(v) => v[i] as f64,
        }
    }

    fn sub(&self, range: Range<usize>) -> Self {
        map_same!(self, v => v[range].to_vec())
    }

    fn append(&mut self, other: &TensorData) -> Result<()> {
        match (self, other) {
            (TensorData::F32(a), TensorData::F32(b)) => a.extend_from_slice(b),
            (TensorData::F64(a), TensorData::F64(b)) => a.extend_from_slice(b),
            (TensorData::I32(a), TensorData::I32(b)) => a.extend_from_slice(b),
            (TensorData::I64(a), TensorData::I64(b)) => a.extend_from_slice(b),
            (TensorData::Bool(a), TensorData::Bool(b)) => a.extend_from_slice(b),
            (TensorData::U8(a), TensorData::U8(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(EnvError::SpaceMismatch(format!(
                    "cannot join {:?} and {:?} tensors",
                    a.dtype(),
                    b.dtype()
                )));
            }
        }
        Ok(())
    }

    /// Copies the elements into `out` in native byte order. Booleans are one byte each.
    pub fn write_ne_bytes(&self, out: &mut [u8]) -> Result<()> {
        let width = self.dtype().size_of();
        if out.len() != self.len() * width {
            return Err(EnvError::SpaceMismatch(format!(
                "buffer holds {} bytes, tensor needs {}",
                out.len(),
                self.len() * width
            )));
        }
        match self {
            TensorData::F32(v) => chunks(out, width, v, |x| x.to_ne_bytes().to_vec()),
            TensorData::F64(v) => chunks(out, width, v, |x| x.to_ne_bytes().to_vec()),
            TensorData::I32(v) => chunks(out, width, v, |x| x.to_ne_bytes().to_vec()),
            TensorData::I64(v) => chunks(out, width, v, |x| x.to_ne_bytes().to_vec()),
            TensorData::Bool(v) => chunks(out, width, v, |x| vec![*x as u8]),
            TensorData::U8(v) => out.copy_from_slice(v),
        }
        Ok(())
    }

    /// Inverse of [`TensorData::write_ne_bytes`].
    pub fn from_ne_bytes(dtype: DType, bytes: &[u8]) -> Self {
        let w = dtype.size_of();
        let it = bytes.chunks_exact(w);
        match dtype {
            DType::F32 => TensorData::F32(it.map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]])).collect()),
            DType::F64 => TensorData::F64(
                it.map(|c| f64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::I32 => TensorData::I32(it.map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]])).collect()),
            DType::I64 => TensorData::I64(
                it.map(|c| i64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::Bool => TensorData::Bool(it.map(|c| c[0] != 0).collect()),
            DType::U8 => TensorData::U8(bytes.to_vec()),
        }
    }
}

fn chunks<T>(out: &mut [u8], width: usize, v: &[T], f: impl Fn(&T) -> Vec<u8>) {
    for (dst, x) in out.chunks_exact_mut(width).zip(v) {
        dst.copy_from_slice(&f(x));
    }
}

/// Rust element types that can back a [`Tensor`].
pub trait Element: Copy + Send + 'static {
    const DTYPE: DType;
    fn wrap(v: Vec<Self>) -> TensorData;
    fn view(d: &TensorData) -> Option<&[Self]>;
}

macro_rules! element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;
            fn wrap(v: Vec<Self>) -> TensorData {
                TensorData::$variant(v)
            }
            fn view(d: &TensorData) -> Option<&[Self]> {
                match d {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

element!(f32, F32);
element!(f64, F64);
element!(i32, I32);
element!(i64, I64);
element!(bool, Bool);
element!(u8, U8);

/// Product of `shape`, or `None` if it does not fit in `usize`.
pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// A dense row-major tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorParts")]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

/// Wire form of a [`Tensor`], checked before it becomes one.
#[derive(Deserialize)]
struct TensorParts {
    shape: Vec<usize>,
    data: TensorData,
}

impl TryFrom<TensorParts> for Tensor {
    type Error = EnvError;

    fn try_from(parts: TensorParts) -> Result<Self> {
        Tensor::new(parts.shape, parts.data)
    }
}

impl Tensor {
    /// Builds a tensor, checking that the element count matches the shape.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        match element_count(&shape) {
            Some(expected) if expected == data.len() => Ok(Self { shape, data }),
            expected => Err(EnvError::SpaceMismatch(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected.map_or_else(|| "too many".to_string(), |n| n.to_string()),
                data.len()
            ))),
        }
    }

    // Caller guarantees `data.len()` matches `shape`.
    pub(crate) fn from_parts(shape: Vec<usize>, data: TensorData) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn from_vec<T: Element>(shape: Vec<usize>, v: Vec<T>) -> Result<Self> {
        Self::new(shape, T::wrap(v))
    }

    /// A rank-0 tensor holding one element.
    pub fn scalar<T: Element>(x: T) -> Self {
        Self { shape: Vec::new(), data: T::wrap(vec![x]) }
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self { shape, data: TensorData::zeros(dtype, n) }
    }

    pub fn dtype(&self) -> DType { self.data.dtype() }
    pub fn shape(&self) -> &[usize] { &self.shape }
    pub fn data(&self) -> &TensorData { &self.data }
    pub fn into_data(self) -> TensorData { self.data }

    /// Elements as a typed slice, if `T` matches the dtype.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(&self.data)
    }

    /// Size of the leading dimension, or `None` for a rank-0 tensor.
    pub fn batch_len(&self) -> Option<usize> {
        self.shape.first().copied()
    }

    /// Number of elements in one slot along the leading dimension.
    fn row_size(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Sub-tensor for `range` along the leading dimension.
    pub fn slice(&self, range: Range<usize>) -> Result<Tensor> {
        let n = self.batch_len().ok_or_else(|| {
            EnvError::SpaceMismatch("cannot slice a rank-0 tensor".into())
        })?;
        if range.start > range.end || range.end > n {
            return Err(EnvError::SpaceMismatch(format!(
                "slice {:?} out of range for leading dimension {}",
                range, n
            )));
        }
        let rs = self.row_size();
        let mut shape = self.shape.clone();
        shape[0] = range.len();
        Ok(Tensor { shape, data: self.data.sub(range.start * rs..range.end * rs) })
    }

    /// Element `i` of the leading dimension with that dimension removed.
    pub fn row(&self, i: usize) -> Result<Tensor> {
        let mut t = self.slice(i..i + 1)?;
        t.shape.remove(0);
        Ok(t)
    }

    /// Joins tensors along the leading dimension. Trailing shapes and dtypes must agree.
    pub fn concat(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| EnvError::SpaceMismatch("nothing to concatenate".into()))?;
        if first.shape.is_empty() {
            return Err(EnvError::SpaceMismatch("cannot concatenate rank-0 tensors".into()));
        }
        let mut data = first.data.clone();
        let mut lead = first.shape[0];
        for p in &parts[1..] {
            if p.shape.len() != first.shape.len() || p.shape[1..] != first.shape[1..] {
                return Err(EnvError::SpaceMismatch(format!(
                    "cannot concatenate shapes {:?} and {:?}",
                    first.shape, p.shape
                )));
            }
            data.append(&p.data)?;
            lead += p.shape[0];
        }
        let mut shape = first.shape.clone();
        shape[0] = lead;
        Ok(Tensor { shape, data })
    }

    /// Stacks same-shaped tensors along a new leading dimension.
    pub fn stack(items: &[Tensor]) -> Result<Tensor> {
        let first = items
            .first()
            .ok_or_else(|| EnvError::SpaceMismatch("nothing to stack".into()))?;
        let mut data = TensorData::zeros(first.dtype(), 0);
        for t in items {
            if t.shape != first.shape {
                return Err(EnvError::SpaceMismatch(format!(
                    "cannot stack shapes {:?} and {:?}",
                    first.shape, t.shape
                )));
            }
            data.append(&t.data)?;
        }
        let mut shape = Vec::with_capacity(first.shape.len() + 1);
        shape.push(items.len());
        shape.extend_from_slice(&first.shape);
        Ok(Tensor { shape, data })
    }
}

/// A tensor or a named aggregate of values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(Tensor),
    Dict(BTreeMap<String, Value>),
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self { Value::Tensor(t) }
}

impl Value {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            Value::Dict(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(d) => d.get(key),
            Value::Tensor(_) => None,
        }
    }

    /// Leading dimension shared by every leaf.
    pub fn batch_len(&self) -> Result<usize> {
        match self {
            Value::Tensor(t) => t
                .batch_len()
                .ok_or_else(|| EnvError::SpaceMismatch("value has no batch dimension".into())),
            Value::Dict(d) => {
                let mut n = None;
                for (k, v) in d {
                    let m = v.batch_len()?;
                    match n {
                        None => n = Some(m),
                        Some(n) if n != m => {
                            return Err(EnvError::SpaceMismatch(format!(
                                "entry {k:?} has batch length {m}, expected {n}"
                            )));
                        }
                        _ => {}
                    }
                }
                n.ok_or_else(|| EnvError::SpaceMismatch("empty aggregate has no batch length".into()))
            }
        }
    }

    pub fn slice(&self, range: Range<usize>) -> Result<Value> {
        match self {
            Value::Tensor(t) => Ok(Value::Tensor(t.slice(range)?)),
            Value::Dict(d) => d
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.slice(range.clone())?)))
                .collect::<Result<_>>()
                .map(Value::Dict),
        }
    }

    pub fn row(&self, i: usize) -> Result<Value> {
        match self {
            Value::Tensor(t) => Ok(Value::Tensor(t.row(i)?)),
            Value::Dict(d) => d
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.row(i)?)))
                .collect::<Result<_>>()
                .map(Value::Dict),
        }
    }

    /// Tensor leaves in sorted-name, depth-first order with dotted paths.
    pub fn leaves(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        self.collect_leaves(String::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: String, out: &mut Vec<(String, &'a Tensor)>) {
        match self {
            Value::Tensor(t) => out.push((prefix, t)),
            Value::Dict(d) => {
                for (k, v) in d {
                    let path = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                    v.collect_leaves(path, out);
                }
            }
        }
    }

    pub fn concat(parts: &[Value]) -> Result<Value> {
        Self::combine(parts, Tensor::concat)
    }

    pub fn stack(items: &[Value]) -> Result<Value> {
        Self::combine(items, Tensor::stack)
    }

    fn combine(parts: &[Value], f: fn(&[Tensor]) -> Result<Tensor>) -> Result<Value> {
        match parts.first() {
            None => Err(EnvError::SpaceMismatch("no values to combine".into())),
            Some(Value::Tensor(_)) => {
                let ts = parts
                    .iter()
                    .map(|p| {
                        p.as_tensor().cloned().ok_or_else(|| {
                            EnvError::SpaceMismatch("cannot combine tensor with aggregate".into())
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Tensor(f(&ts)?))
            }
            Some(Value::Dict(first)) => {
                let mut out = BTreeMap::new();
                for key in first.keys() {
                    let sub = parts
                        .iter()
                        .map(|p| {
                            p.get(key).cloned().ok_or_else(|| {
                                EnvError::SpaceMismatch(format!("aggregate is missing key {key:?}"))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    out.insert(key.clone(), Self::combine(&sub, f)?);
                }
                Ok(Value::Dict(out))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(shape: Vec<usize>, v: Vec<f32>) -> Tensor {
        Tensor::from_vec(shape, v).unwrap()
    }

    #[test]
    fn shape_must_match_element_count() {
        assert!(Tensor::from_vec(vec![2, 2], vec![0i32; 3]).is_err());
        assert!(Tensor::from_vec(vec![2, 2], vec![0i32; 4]).is_ok());
    }

    #[derive(Serialize)]
    struct Unchecked {
        shape: Vec<usize>,
        data: TensorData,
    }

    #[test]
    fn decoding_checks_element_count() {
        let short = bincode::serialize(&Unchecked { shape: vec![2], data: TensorData::F32(vec![1.0]) }).unwrap();
        assert!(bincode::deserialize::<Tensor>(&short).is_err());

        let huge = Unchecked { shape: vec![usize::MAX, 2], data: TensorData::U8(vec![]) };
        assert!(bincode::deserialize::<Tensor>(&bincode::serialize(&huge).unwrap()).is_err());

        let full = bincode::serialize(&Unchecked { shape: vec![2], data: TensorData::F32(vec![1.0, 2.0]) }).unwrap();
        assert_eq!(bincode::deserialize::<Tensor>(&full).unwrap(), t(vec![2], vec![1.0, 2.0]));
    }

    #[test]
    fn slice_and_row_follow_leading_dim() {
        let x = t(vec![3, 2], vec![0., 1., 2., 3., 4., 5.]);
        let s = x.slice(1..3).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.as_slice::<f32>().unwrap(), &[2., 3., 4., 5.]);
        let r = x.row(2).unwrap();
        assert_eq!(r.shape(), &[2]);
        assert_eq!(r.as_slice::<f32>().unwrap(), &[4., 5.]);
        assert!(x.slice(2..4).is_err());
    }

    #[test]
    fn concat_and_stack() {
        let a = t(vec![1, 2], vec![1., 2.]);
        let b = t(vec![2, 2], vec![3., 4., 5., 6.]);
        let c = Tensor::concat(&[a, b]).unwrap();
        assert_eq!(c.shape(), &[3, 2]);
        assert_eq!(c.as_slice::<f32>().unwrap(), &[1., 2., 3., 4., 5., 6.]);

        let s = Tensor::stack(&[Tensor::scalar(1i64), Tensor::scalar(7i64)]).unwrap();
        assert_eq!(s.shape(), &[2]);
        assert_eq!(s.as_slice::<i64>().unwrap(), &[1, 7]);

        let bad = Tensor::concat(&[t(vec![1, 2], vec![0., 0.]), t(vec![1, 3], vec![0., 0., 0.])]);
        assert!(bad.is_err());
        let mixed = Tensor::concat(&[t(vec![1], vec![0.]), Tensor::from_vec(vec![1], vec![0u8]).unwrap()]);
        assert!(mixed.is_err());
    }

    #[test]
    fn dict_values_combine_per_key() {
        let mk = |x: f32, k: i64| {
            let mut d = BTreeMap::new();
            d.insert("pos".to_string(), Value::Tensor(t(vec![1, 1], vec![x])));
            d.insert("id".to_string(), Value::Tensor(Tensor::from_vec(vec![1], vec![k]).unwrap()));
            Value::Dict(d)
        };
        let v = Value::concat(&[mk(0.5, 1), mk(1.5, 2)]).unwrap();
        assert_eq!(v.batch_len().unwrap(), 2);
        let row = v.row(1).unwrap();
        assert_eq!(row.get("id").unwrap().as_tensor().unwrap().as_slice::<i64>().unwrap(), &[2]);
    }

    #[test]
    fn native_bytes_round_trip() {
        let d = TensorData::I64(vec![-3, 9]);
        let mut buf = vec![0u8; 16];
        d.write_ne_bytes(&mut buf).unwrap();
        assert_eq!(TensorData::from_ne_bytes(DType::I64, &buf), d);
        assert!(d.write_ne_bytes(&mut [0u8; 8]).is_err());
    }
}
