//! Core traits and types for batched environments.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::spaces::{Space, Tensor, Value};

/// A small ordered key-value record returned per episode index by `get_info`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    entries: Vec<(String, InfoValue)>,
}

impl Info {
    /// Create an empty Info map.
    pub fn new() -> Self { Self { entries: Vec::new() } }

    /// Insert or replace a key with the given value.
    pub fn insert<K: Into<String>>(&mut self, key: K, value: InfoValue) {
        let k = key.into();
        if let Some((_, v)) = self.entries.iter_mut().find(|(kk, _)| kk == &k) {
            *v = value;
        } else {
            self.entries.push((k, value));
        }
    }

    /// Get a reference to a value by key.
    pub fn get(&self, key: &str) -> Option<&InfoValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Iterate over entries.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &InfoValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn len(&self) -> usize { self.entries.len() }
}

/// Opaque per-index value used in info records and `callmethod` arguments and results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum InfoValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Tensor(Tensor),
    List(Vec<InfoValue>),
}

impl InfoValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            InfoValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            InfoValue::F64(v) => Some(*v),
            InfoValue::I64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            InfoValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for InfoValue { fn from(v: bool) -> Self { InfoValue::Bool(v) } }
impl From<i64> for InfoValue { fn from(v: i64) -> Self { InfoValue::I64(v) } }
impl From<i32> for InfoValue { fn from(v: i32) -> Self { InfoValue::I64(v as i64) } }
impl From<u64> for InfoValue { fn from(v: u64) -> Self { InfoValue::I64(v as i64) } }
impl From<f64> for InfoValue { fn from(v: f64) -> Self { InfoValue::F64(v) } }
impl From<f32> for InfoValue { fn from(v: f32) -> Self { InfoValue::F64(v as f64) } }
impl From<&str> for InfoValue { fn from(v: &str) -> Self { InfoValue::Str(v.to_string()) } }
impl From<String> for InfoValue { fn from(v: String) -> Self { InfoValue::Str(v) } }
impl From<Tensor> for InfoValue { fn from(v: Tensor) -> Self { InfoValue::Tensor(v) } }

/// The batched result of `observe`.
///
/// `reward[i]` belongs to the transition that produced the current observation
/// at index `i`. `first[i]` is true iff that index's episode just began; the
/// reward next to a `first` flag carries no meaning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timestep {
    pub reward: Vec<f32>,
    pub ob: Value,
    pub first: Vec<bool>,
}

impl Timestep {
    pub fn new(reward: Vec<f32>, ob: Value, first: Vec<bool>) -> Self {
        Self { reward, ob, first }
    }

    /// Checks lengths against `num` and the observation against `ob_space`.
    pub fn validate(&self, num: usize, ob_space: &Space) -> Result<()> {
        if self.reward.len() != num || self.first.len() != num {
            return Err(EnvError::SpaceMismatch(format!(
                "timestep has {} rewards and {} first flags, expected {}",
                self.reward.len(),
                self.first.len(),
                num
            )));
        }
        if !ob_space.contains_batch(&self.ob, num) {
            return Err(EnvError::SpaceMismatch("observation is not in ob_space".into()));
        }
        Ok(())
    }

    pub fn concat(parts: &[Timestep]) -> Result<Timestep> {
        let obs: Vec<Value> = parts.iter().map(|p| p.ob.clone()).collect();
        Ok(Timestep {
            reward: parts.iter().flat_map(|p| p.reward.iter().copied()).collect(),
            ob: Value::concat(&obs)?,
            first: parts.iter().flat_map(|p| p.first.iter().copied()).collect(),
        })
    }
}

/// Error categories, serializable so they survive the process boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SpaceDefinition,
    SpaceMismatch,
    MethodNotFound,
    SubprocessCrash,
    IpcTimeout,
    AbiVersion,
    Implementation,
    Closed,
    Io,
    Codec,
    Config,
    Library,
    Other,
}

/// Recoverable errors across the environment APIs.
#[derive(thiserror::Error, Debug)]
pub enum EnvError {
    #[error("Malformed space: {0}")]
    SpaceDefinition(String),
    #[error("Space mismatch: {0}")]
    SpaceMismatch(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Subprocess crashed: {0}")]
    SubprocessCrash(String),
    #[error("No reply from subprocess within {0:?}")]
    IpcTimeout(Duration),
    #[error("ABI version mismatch: expected {expected}, found {found}")]
    AbiVersion { expected: u32, found: u32 },
    #[error("Implementation returned code {code}: {message}")]
    Implementation { code: i32, message: String },
    #[error("Environment is closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("Library error: {0}")]
    Library(String),
    #[error("Other error: {0}")]
    Other(String),
}

impl EnvError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EnvError::SpaceDefinition(_) => ErrorKind::SpaceDefinition,
            EnvError::SpaceMismatch(_) => ErrorKind::SpaceMismatch,
            EnvError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            EnvError::SubprocessCrash(_) => ErrorKind::SubprocessCrash,
            EnvError::IpcTimeout(_) => ErrorKind::IpcTimeout,
            EnvError::AbiVersion { .. } => ErrorKind::AbiVersion,
            EnvError::Implementation { .. } => ErrorKind::Implementation,
            EnvError::Closed => ErrorKind::Closed,
            EnvError::Io(_) => ErrorKind::Io,
            EnvError::Codec(_) => ErrorKind::Codec,
            EnvError::Config(_) => ErrorKind::Config,
            EnvError::Library(_) => ErrorKind::Library,
            EnvError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the instance that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EnvError::SubprocessCrash(_) | EnvError::IpcTimeout(_) | EnvError::Closed)
    }
}

/// Convenience alias for results using EnvError.
pub type Result<T> = std::result::Result<T, EnvError>;

/// Arguments of a `callmethod` invocation. Every positional and keyword
/// argument holds one entry per episode index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub args: Vec<Vec<InfoValue>>,
    pub kwargs: BTreeMap<String, Vec<InfoValue>>,
}

/// The arguments seen by one episode index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallRow {
    pub args: Vec<InfoValue>,
    pub kwargs: BTreeMap<String, InfoValue>,
}

impl CallArgs {
    pub fn new() -> Self { Self::default() }

    pub fn arg(mut self, per_index: Vec<InfoValue>) -> Self {
        self.args.push(per_index);
        self
    }

    pub fn kwarg<K: Into<String>>(mut self, key: K, per_index: Vec<InfoValue>) -> Self {
        self.kwargs.insert(key.into(), per_index);
        self
    }

    /// Fails unless every argument has exactly `num` entries.
    pub fn check_len(&self, num: usize) -> Result<()> {
        let bad = self
            .args
            .iter()
            .map(|a| ("positional", a.len()))
            .chain(self.kwargs.values().map(|a| ("keyword", a.len())))
            .find(|(_, n)| *n != num);
        match bad {
            Some((what, n)) => Err(EnvError::SpaceMismatch(format!(
                "{what} argument has {n} entries, expected {num}"
            ))),
            None => Ok(()),
        }
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> CallArgs {
        CallArgs {
            args: self.args.iter().map(|a| a[range.clone()].to_vec()).collect(),
            kwargs: self.kwargs.iter().map(|(k, a)| (k.clone(), a[range.clone()].to_vec())).collect(),
        }
    }

    pub fn row(&self, i: usize) -> CallRow {
        CallRow {
            args: self.args.iter().map(|a| a[i].clone()).collect(),
            kwargs: self.kwargs.iter().map(|(k, a)| (k.clone(), a[i].clone())).collect(),
        }
    }
}

type Handler<E> = Box<dyn Fn(&mut E, usize, &CallArgs) -> Result<Vec<InfoValue>> + Send + Sync>;

/// Named operations an environment exposes through `callmethod`.
///
/// Environments keep their table behind an `Arc` so it can be cloned out
/// before the handler borrows the environment mutably.
pub struct MethodTable<E> {
    handlers: HashMap<String, Handler<E>>,
}

impl<E> Default for MethodTable<E> {
    fn default() -> Self { Self { handlers: HashMap::new() } }
}

impl<E> MethodTable<E> {
    pub fn new() -> Self { Self::default() }

    /// Registers a handler that receives the whole batch of arguments and
    /// returns one result per index.
    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut E, &CallArgs) -> Result<Vec<InfoValue>> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(move |env, _num, args| f(env, args)));
        self
    }

    /// Registers a handler called once per episode index.
    pub fn with_per_index<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut E, usize, CallRow) -> Result<InfoValue> + Send + Sync + 'static,
    {
        let h: Handler<E> = Box::new(move |env, num, args| (0..num).map(|i| f(env, i, args.row(i))).collect());
        self.handlers.insert(name.to_string(), h);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatches `name`, checking argument and result lengths against `num`.
    pub fn call(&self, env: &mut E, num: usize, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        let h = self
            .handlers
            .get(name)
            .ok_or_else(|| EnvError::MethodNotFound(name.to_string()))?;
        args.check_len(num)?;
        let out = h(env, num, args)?;
        if out.len() != num {
            return Err(EnvError::Other(format!(
                "method {name:?} returned {} results for {num} indices",
                out.len()
            )));
        }
        Ok(out)
    }
}

/// The batched environment contract.
///
/// An `Env` steps `num` episodes at once. `observe` is idempotent: between two
/// `act` calls it always returns the same timestep and never changes state.
/// Before the first `act`, `observe` reports the initial state with every
/// `first` flag set. `act` applies exactly one transition to every index.
pub trait Env: Send {
    /// Number of episode slots, fixed for the lifetime of the instance.
    fn num(&self) -> usize;

    fn ob_space(&self) -> &Space;

    fn ac_space(&self) -> &Space;

    /// Reward, observation and first flags for the current, settled state.
    fn observe(&mut self) -> Result<Timestep>;

    /// Applies one step to every index. `ac` carries a leading dimension of `num`.
    fn act(&mut self, ac: &Value) -> Result<()>;

    /// Diagnostic records aligned with the current observation.
    fn get_info(&mut self) -> Result<Vec<Info>>;

    /// Invokes a named operation. Unknown names fail with `MethodNotFound`.
    fn callmethod(&mut self, name: &str, _args: &CallArgs) -> Result<Vec<InfoValue>> {
        Err(EnvError::MethodNotFound(name.to_string()))
    }

    /// Names `callmethod` can dispatch, sorted.
    fn method_names(&self) -> Vec<String> { Vec::new() }

    /// Whether `callmethod(name, ..)` would find a handler.
    fn has_method(&self, name: &str) -> bool {
        self.method_names().iter().any(|m| m == name)
    }

    /// The immediately wrapped env, for wrappers.
    fn inner_env(&self) -> Option<EnvRef<'_>> { None }

    /// Release any external resources. Further calls may fail with `Closed`.
    fn close(&mut self) -> Result<()> { Ok(()) }
}

impl<E: Env + ?Sized> Env for Box<E> {
    fn num(&self) -> usize { (**self).num() }
    fn ob_space(&self) -> &Space { (**self).ob_space() }
    fn ac_space(&self) -> &Space { (**self).ac_space() }
    fn observe(&mut self) -> Result<Timestep> { (**self).observe() }
    fn act(&mut self, ac: &Value) -> Result<()> { (**self).act(ac) }
    fn get_info(&mut self) -> Result<Vec<Info>> { (**self).get_info() }
    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        (**self).callmethod(name, args)
    }
    fn method_names(&self) -> Vec<String> { (**self).method_names() }
    fn has_method(&self, name: &str) -> bool { (**self).has_method(name) }
    fn inner_env(&self) -> Option<EnvRef<'_>> { (**self).inner_env() }
    fn close(&mut self) -> Result<()> { (**self).close() }
}

/// Borrow of a wrapped env, either direct or through a lock guard.
pub enum EnvRef<'a> {
    Borrowed(&'a (dyn Env + 'a)),
    Guarded(Box<dyn Deref<Target = dyn Env + 'a> + 'a>),
}

impl<'a> Deref for EnvRef<'a> {
    type Target = dyn Env + 'a;

    fn deref(&self) -> &Self::Target {
        match self {
            EnvRef::Borrowed(e) => *e,
            EnvRef::Guarded(g) => &***g,
        }
    }
}

/// Runs `f` on the innermost env of a wrapper chain.
pub fn with_base_env<R>(env: &dyn Env, f: impl FnOnce(&dyn Env) -> R) -> R {
    match env.inner_env() {
        Some(inner) => with_base_env(&*inner, f),
        None => f(env),
    }
}

/// Number of wrappers above the innermost env.
pub fn chain_depth(env: &dyn Env) -> usize {
    match env.inner_env() {
        Some(inner) => 1 + chain_depth(&*inner),
        None => 0,
    }
}

/// Fails with `SpaceMismatch` unless `ac` is a batch of `num` members of `space`.
pub fn check_action(space: &Space, ac: &Value, num: usize) -> Result<()> {
    if space.contains_batch(ac, num) {
        Ok(())
    } else {
        Err(EnvError::SpaceMismatch(format!("action is not a batch of {num} members of ac_space")))
    }
}

/// Shared handle to a method table.
pub type Methods<E> = Arc<MethodTable<E>>;
