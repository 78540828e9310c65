//! Spaces describe the legal values of observations and actions.
//!
//! A [`Space`] is either a tensor leaf ([`TensorSpace`]) with a shape, an
//! element type and optional per-element bounds, or a named aggregate of
//! sub-spaces. Aggregates are keyed by name; equality ignores insertion
//! order and the wire layout follows sorted name order.

pub mod value;
#[cfg(feature = "ndarray")]
pub mod interop;

use std::collections::BTreeMap;

use rand::Rng;
use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use crate::core::{EnvError, Result};

pub use value::{Element, Tensor, TensorData, Value};

use value::element_count;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
    U8,
}

impl DType {
    /// Stable numeric tag used by the foreign ABI.
    pub fn tag(self) -> u32 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::Bool => 4,
            DType::U8 => 5,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => DType::F32,
            1 => DType::F64,
            2 => DType::I32,
            3 => DType::I64,
            4 => DType::Bool,
            5 => DType::U8,
            _ => return None,
        })
    }

    /// Width of one element in bytes.
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::Bool | DType::U8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    fn range(self) -> (f64, f64) {
        match self {
            DType::F32 => (f32::MIN as f64, f32::MAX as f64),
            DType::F64 => (f64::MIN, f64::MAX),
            DType::I32 => (i32::MIN as f64, i32::MAX as f64),
            DType::I64 => (i64::MIN as f64, i64::MAX as f64),
            DType::Bool => (0.0, 1.0),
            DType::U8 => (0.0, 255.0),
        }
    }
}

/// A tensor leaf: shape, element type, and optional inclusive bounds per element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorSpaceParts")]
pub struct TensorSpace {
    shape: Vec<usize>,
    dtype: DType,
    low: Option<Vec<f64>>,
    high: Option<Vec<f64>>,
}

/// Wire form of a [`TensorSpace`]; goes through the same checks as the builders.
#[derive(Deserialize)]
struct TensorSpaceParts {
    shape: Vec<usize>,
    dtype: DType,
    low: Option<Vec<f64>>,
    high: Option<Vec<f64>>,
}

impl TryFrom<TensorSpaceParts> for TensorSpace {
    type Error = EnvError;

    fn try_from(p: TensorSpaceParts) -> Result<Self> {
        let space = TensorSpace::new(p.shape, p.dtype)?;
        match (p.low, p.high) {
            (Some(low), Some(high)) => space.with_bounds(low, high),
            (None, None) => Ok(space),
            _ => Err(EnvError::SpaceDefinition("only one of low and high is set".into())),
        }
    }
}

impl TensorSpace {
    /// Unbounded tensor space. Every dimension must be positive and the
    /// element count must fit in `usize`.
    pub fn new(shape: Vec<usize>, dtype: DType) -> Result<Self> {
        if let Some(i) = shape.iter().position(|&d| d == 0) {
            return Err(EnvError::SpaceDefinition(format!(
                "dimension {i} of shape {shape:?} is zero"
            )));
        }
        if element_count(&shape).is_none() {
            return Err(EnvError::SpaceDefinition(format!("shape {shape:?} has too many elements")));
        }
        Ok(Self { shape, dtype, low: None, high: None })
    }

    /// Adds per-element bounds. `low` and `high` must have one entry per element.
    pub fn with_bounds(mut self, low: Vec<f64>, high: Vec<f64>) -> Result<Self> {
        let n = self.size();
        if low.len() != n || high.len() != n {
            return Err(EnvError::SpaceDefinition(format!(
                "bounds have {} and {} entries, shape {:?} has {} elements",
                low.len(),
                high.len(),
                self.shape,
                n
            )));
        }
        let (min, max) = self.dtype.range();
        for (i, (&lo, &hi)) in low.iter().zip(&high).enumerate() {
            if lo.is_nan() || hi.is_nan() || lo > hi {
                return Err(EnvError::SpaceDefinition(format!(
                    "invalid bounds [{lo}, {hi}] at element {i}"
                )));
            }
            if !self.dtype.is_float() {
                if lo.ceil() > hi.floor() {
                    return Err(EnvError::SpaceDefinition(format!(
                        "bounds [{lo}, {hi}] at element {i} contain no {:?} value",
                        self.dtype
                    )));
                }
                if hi.floor() < min || lo.ceil() > max {
                    return Err(EnvError::SpaceDefinition(format!(
                        "bounds [{lo}, {hi}] at element {i} fall outside {:?}",
                        self.dtype
                    )));
                }
            }
        }
        self.low = Some(low);
        self.high = Some(high);
        Ok(self)
    }

    /// Same bounds for every element.
    pub fn with_uniform_bounds(self, low: f64, high: f64) -> Result<Self> {
        let n = self.size();
        self.with_bounds(vec![low; n], vec![high; n])
    }

    pub fn shape(&self) -> &[usize] { &self.shape }
    pub fn dtype(&self) -> DType { self.dtype }
    pub fn low(&self) -> Option<&[f64]> { self.low.as_deref() }
    pub fn high(&self) -> Option<&[f64]> { self.high.as_deref() }

    /// Number of elements in one value.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    fn bounds(&self, i: usize) -> Option<(f64, f64)> {
        match (&self.low, &self.high) {
            (Some(l), Some(h)) => Some((l[i], h[i])),
            _ => None,
        }
    }

    // `lead` is the expected leading batch dimension, if any.
    fn check(&self, t: &Tensor, lead: Option<usize>) -> bool {
        if t.dtype() != self.dtype {
            return false;
        }
        let shape = t.shape();
        let inner = match lead {
            Some(n) => {
                if shape.first() != Some(&n) {
                    return false;
                }
                &shape[1..]
            }
            None => shape,
        };
        if inner != self.shape.as_slice() {
            return false;
        }
        let n = self.size();
        let data = t.data();
        if lead.map_or(Some(n), |l| l.checked_mul(n)) != Some(data.len()) {
            return false;
        }
        (0..data.len()).all(|k| {
            let x = data.get_f64(k);
            match self.bounds(k % n) {
                Some((lo, hi)) => lo <= x && x <= hi,
                None => true,
            }
        })
    }

    pub fn contains(&self, t: &Tensor) -> bool {
        self.check(t, None)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Tensor {
        let n = self.size();
        let data = match self.dtype {
            DType::F32 => TensorData::F32((0..n).map(|i| self.sample_f32(i, rng)).collect()),
            DType::F64 => TensorData::F64((0..n).map(|i| self.sample_float(i, rng)).collect()),
            DType::I32 => TensorData::I32((0..n).map(|i| self.sample_int(i, rng) as i32).collect()),
            DType::I64 => TensorData::I64((0..n).map(|i| self.sample_int(i, rng)).collect()),
            DType::Bool => TensorData::Bool((0..n).map(|i| self.sample_int(i, rng) != 0).collect()),
            DType::U8 => TensorData::U8((0..n).map(|i| self.sample_int(i, rng) as u8).collect()),
        };
        Tensor::from_parts(self.shape.clone(), data)
    }

    // Unbounded floats are drawn from [-1, 1].
    fn sample_float<R: Rng + ?Sized>(&self, i: usize, rng: &mut R) -> f64 {
        let (min, max) = self.dtype.range();
        let (lo, hi) = match self.bounds(i) {
            Some((lo, hi)) => (lo.max(min), hi.min(max)),
            None => (-1.0, 1.0),
        };
        if lo >= hi {
            return lo;
        }
        // A span wider than f64::MAX is halved.
        let (lo, hi) = if (hi - lo).is_finite() { (lo, hi) } else { (lo / 2.0, hi / 2.0) };
        Uniform::new_inclusive(lo, hi).sample(rng)
    }

    // Rounding to f32 may step just outside the f64 bounds; step back in.
    fn sample_f32<R: Rng + ?Sized>(&self, i: usize, rng: &mut R) -> f32 {
        let y = self.sample_float(i, rng) as f32;
        let Some((lo, hi)) = self.bounds(i) else { return y };
        if (y as f64) > hi {
            next_f32(y, false)
        } else if (y as f64) < lo {
            next_f32(y, true)
        } else {
            y
        }
    }

    fn sample_int<R: Rng + ?Sized>(&self, i: usize, rng: &mut R) -> i64 {
        let (min, max) = self.dtype.range();
        let (lo, hi) = match self.bounds(i) {
            Some((lo, hi)) => (lo.ceil().max(min), hi.floor().min(max)),
            None => (min, max),
        };
        let (lo, hi) = (lo as i64, hi as i64);
        if lo == hi {
            return lo;
        }
        Uniform::new_inclusive(lo, hi).sample(rng)
    }

    pub fn zero(&self) -> Tensor {
        Tensor::zeros(self.dtype, self.shape.clone())
    }
}

// Adjacent representable f32 above (`up`) or below `v`.
fn next_f32(v: f32, up: bool) -> f32 {
    if v == 0.0 {
        let tiny = f32::from_bits(1);
        return if up { tiny } else { -tiny };
    }
    let bits = v.to_bits();
    if (v > 0.0) == up { f32::from_bits(bits + 1) } else { f32::from_bits(bits - 1) }
}

/// The set of legal values for an observation or action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Space {
    Tensor(TensorSpace),
    Dict(BTreeMap<String, Space>),
}

impl From<TensorSpace> for Space {
    fn from(s: TensorSpace) -> Self { Space::Tensor(s) }
}

impl Space {
    /// Integer scalar in `[0, n)`.
    pub fn discrete(n: u32) -> Result<Space> {
        if n == 0 {
            return Err(EnvError::SpaceDefinition("discrete space requires n > 0".into()));
        }
        Ok(TensorSpace::new(vec![], DType::I64)?
            .with_uniform_bounds(0.0, (n - 1) as f64)?
            .into())
    }

    /// Vector of `n` bytes, each 0 or 1.
    pub fn binary(n: usize) -> Result<Space> {
        Ok(TensorSpace::new(vec![n], DType::U8)?.with_uniform_bounds(0.0, 1.0)?.into())
    }

    /// Bounded float32 box.
    pub fn boxed(shape: Vec<usize>, low: f64, high: f64) -> Result<Space> {
        Ok(TensorSpace::new(shape, DType::F32)?.with_uniform_bounds(low, high)?.into())
    }

    /// Named aggregate. Names must be non-empty and unique.
    pub fn dict<K, I>(entries: I) -> Result<Space>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Space)>,
    {
        let mut map = BTreeMap::new();
        for (k, s) in entries {
            let k = k.into();
            if k.is_empty() {
                return Err(EnvError::SpaceDefinition("aggregate entry with empty name".into()));
            }
            if map.insert(k.clone(), s).is_some() {
                return Err(EnvError::SpaceDefinition(format!("duplicate aggregate entry {k:?}")));
            }
        }
        Ok(Space::Dict(map))
    }

    pub fn as_tensor(&self) -> Option<&TensorSpace> {
        match self {
            Space::Tensor(t) => Some(t),
            Space::Dict(_) => None,
        }
    }

    /// Structural membership, including bounds, recursive for aggregates.
    pub fn contains(&self, v: &Value) -> bool {
        self.check(v, None)
    }

    /// Membership of a value batched over `num` episodes along the leading dimension.
    pub fn contains_batch(&self, v: &Value, num: usize) -> bool {
        self.check(v, Some(num))
    }

    fn check(&self, v: &Value, lead: Option<usize>) -> bool {
        match (self, v) {
            (Space::Tensor(s), Value::Tensor(t)) => s.check(t, lead),
            (Space::Dict(s), Value::Dict(d)) => {
                s.len() == d.len()
                    && s.iter().all(|(k, sub)| d.get(k).is_some_and(|x| sub.check(x, lead)))
            }
            _ => false,
        }
    }

    /// A uniformly drawn member; aggregate leaves are drawn independently.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Value {
        match self {
            Space::Tensor(s) => Value::Tensor(s.sample(rng)),
            Space::Dict(d) => Value::Dict(d.iter().map(|(k, s)| (k.clone(), s.sample(rng))).collect()),
        }
    }

    pub fn zero(&self) -> Value {
        match self {
            Space::Tensor(s) => Value::Tensor(s.zero()),
            Space::Dict(d) => Value::Dict(d.iter().map(|(k, s)| (k.clone(), s.zero())).collect()),
        }
    }

    pub fn sample_batch<R: Rng + ?Sized>(&self, rng: &mut R, num: usize) -> Result<Value> {
        let items: Vec<Value> = (0..num).map(|_| self.sample(rng)).collect();
        Value::stack(&items)
    }

    pub fn zero_batch(&self, num: usize) -> Result<Value> {
        Value::stack(&vec![self.zero(); num])
    }

    /// Tensor leaves in wire order (sorted names, depth first) with dotted paths.
    pub fn leaves(&self) -> Vec<(String, &TensorSpace)> {
        let mut out = Vec::new();
        self.collect_leaves(String::new(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, prefix: String, out: &mut Vec<(String, &'a TensorSpace)>) {
        match self {
            Space::Tensor(t) => out.push((prefix, t)),
            Space::Dict(d) => {
                for (k, s) in d {
                    let path = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                    s.collect_leaves(path, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn malformed_spaces_are_rejected() {
        assert!(matches!(TensorSpace::new(vec![3, 0], DType::F32), Err(EnvError::SpaceDefinition(_))));
        assert!(matches!(
            TensorSpace::new(vec![usize::MAX / 2, 3], DType::F32),
            Err(EnvError::SpaceDefinition(_))
        ));
        let s = TensorSpace::new(vec![2], DType::F32).unwrap();
        assert!(s.clone().with_bounds(vec![0.0], vec![1.0]).is_err());
        assert!(s.clone().with_bounds(vec![1.0, 0.0], vec![0.0, 1.0]).is_err());
        assert!(TensorSpace::new(vec![], DType::I32).unwrap().with_uniform_bounds(0.2, 0.8).is_err());
        assert!(Space::discrete(0).is_err());
        assert!(Space::dict([("a", Space::binary(2).unwrap()), ("a", Space::binary(3).unwrap())]).is_err());
    }

    #[derive(Serialize)]
    struct Unchecked {
        shape: Vec<usize>,
        dtype: DType,
        low: Option<Vec<f64>>,
        high: Option<Vec<f64>>,
    }

    fn decode(u: &Unchecked) -> bincode::Result<TensorSpace> {
        bincode::deserialize(&bincode::serialize(u).unwrap())
    }

    #[test]
    fn decoded_spaces_are_validated() {
        let short = Unchecked { shape: vec![2], dtype: DType::F32, low: Some(vec![0.0]), high: Some(vec![1.0]) };
        assert!(decode(&short).is_err());
        let one_sided = Unchecked { shape: vec![2], dtype: DType::F32, low: Some(vec![0.0; 2]), high: None };
        assert!(decode(&one_sided).is_err());
        let huge = Unchecked { shape: vec![usize::MAX, 2], dtype: DType::U8, low: None, high: None };
        assert!(decode(&huge).is_err());

        let ok = Unchecked { shape: vec![2], dtype: DType::F32, low: Some(vec![0.0; 2]), high: Some(vec![1.0; 2]) };
        let expected = TensorSpace::new(vec![2], DType::F32).unwrap().with_uniform_bounds(0.0, 1.0).unwrap();
        assert_eq!(decode(&ok).unwrap(), expected);
    }

    #[test]
    fn box_sample_and_zero_are_members() {
        let mut rng = StdRng::seed_from_u64(42);
        let b = Space::boxed(vec![4], -1.0, 1.0).unwrap();
        for _ in 0..100 {
            assert!(b.contains(&b.sample(&mut rng)));
        }
        assert!(b.contains(&b.zero()));
        let out = Value::Tensor(Tensor::from_vec(vec![4], vec![0.0f32, 0.5, 1.5, 0.0]).unwrap());
        assert!(!b.contains(&out));
    }

    #[test]
    fn discrete_and_binary() {
        let mut rng = StdRng::seed_from_u64(7);
        let d = Space::discrete(5).unwrap();
        for _ in 0..100 {
            let v = d.sample(&mut rng);
            let x = v.as_tensor().unwrap().as_slice::<i64>().unwrap()[0];
            assert!((0..5).contains(&x));
        }
        assert!(!d.contains(&Value::Tensor(Tensor::scalar(5i64))));
        assert!(!d.contains(&Value::Tensor(Tensor::scalar(2i32))));

        let mb = Space::binary(8).unwrap();
        let bad = Tensor::from_vec(vec![8], vec![0u8, 1, 2, 0, 1, 0, 1, 0]).unwrap();
        assert!(!mb.contains(&Value::Tensor(bad)));
    }

    #[test]
    fn aggregate_equality_ignores_order() {
        let a = Space::dict([("x", Space::discrete(2).unwrap()), ("y", Space::binary(3).unwrap())]).unwrap();
        let b = Space::dict([("y", Space::binary(3).unwrap()), ("x", Space::discrete(2).unwrap())]).unwrap();
        assert_eq!(a, b);
        let names: Vec<_> = a.leaves().into_iter().map(|(p, _)| p).collect();
        assert_eq!(names, vec!["x", "y"]);
    }

    #[test]
    fn nested_aggregates_sample_into_themselves() {
        let inner = Space::dict([("v", Space::boxed(vec![2], 0.0, 1.0).unwrap())]).unwrap();
        let s = Space::dict([("inner", inner), ("k", Space::discrete(3).unwrap())]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(s.contains(&s.sample(&mut rng)));
        assert!(s.contains(&s.zero()));
        assert_eq!(s.leaves()[0].0, "inner.v");
    }

    #[test]
    fn batched_membership_checks_leading_dim() {
        let s = Space::boxed(vec![2], -1.0, 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let v = s.sample_batch(&mut rng, 3).unwrap();
        assert!(s.contains_batch(&v, 3));
        assert!(!s.contains_batch(&v, 2));
        assert!(!s.contains(&v));
        assert!(s.contains_batch(&s.zero_batch(5).unwrap(), 5));
    }
}
