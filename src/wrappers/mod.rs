//! Wrappers decorate an inner env, forwarding every call unless overridden.
//!
//! Provided wrappers:
//! - Wrapper (per-operation override closures and extra methods)
//! - EpisodeStatistics
//! - ExtractDictOb
//! - AssertSpaces
//! - AsynchronousWrapper

pub mod asynchronous;

pub use asynchronous::AsynchronousWrapper;

use crate::core::{
    CallArgs, Env, EnvError, EnvRef, Info, InfoValue, MethodTable, Result, Timestep, check_action,
};
use crate::spaces::{Space, Value};

type ObserveFn<E> = Box<dyn FnMut(&mut E) -> Result<Timestep> + Send>;
type ActFn<E> = Box<dyn FnMut(&mut E, &Value) -> Result<()> + Send>;
type InfoFn<E> = Box<dyn FnMut(&mut E) -> Result<Vec<Info>> + Send>;

/// General-purpose wrapper built from optional override closures.
///
/// Every operation without an override is forwarded verbatim. Methods
/// registered with [`Wrapper::with_method`] take precedence over the inner
/// env's methods of the same name.
pub struct Wrapper<E: Env> {
    env: E,
    observe: Option<ObserveFn<E>>,
    act: Option<ActFn<E>>,
    get_info: Option<InfoFn<E>>,
    methods: MethodTable<E>,
    ob_space: Option<Space>,
    ac_space: Option<Space>,
}

impl<E: Env> Wrapper<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            observe: None,
            act: None,
            get_info: None,
            methods: MethodTable::new(),
            ob_space: None,
            ac_space: None,
        }
    }

    pub fn on_observe<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut E) -> Result<Timestep> + Send + 'static,
    {
        self.observe = Some(Box::new(f));
        self
    }

    pub fn on_act<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut E, &Value) -> Result<()> + Send + 'static,
    {
        self.act = Some(Box::new(f));
        self
    }

    pub fn on_get_info<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut E) -> Result<Vec<Info>> + Send + 'static,
    {
        self.get_info = Some(Box::new(f));
        self
    }

    /// Adds a method handled by this wrapper. The handler sees the inner env.
    pub fn with_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut E, &CallArgs) -> Result<Vec<InfoValue>> + Send + Sync + 'static,
    {
        self.methods = self.methods.with(name, f);
        self
    }

    /// Declares the observation space produced by an `on_observe` override.
    pub fn with_ob_space(mut self, space: Space) -> Self {
        self.ob_space = Some(space);
        self
    }

    /// Declares the action space accepted by an `on_act` override.
    pub fn with_ac_space(mut self, space: Space) -> Self {
        self.ac_space = Some(space);
        self
    }

    pub fn inner(&self) -> &E { &self.env }
    pub fn inner_mut(&mut self) -> &mut E { &mut self.env }
    pub fn into_inner(self) -> E { self.env }
}

impl<E: Env> Env for Wrapper<E> {
    fn num(&self) -> usize { self.env.num() }

    fn ob_space(&self) -> &Space {
        self.ob_space.as_ref().unwrap_or_else(|| self.env.ob_space())
    }

    fn ac_space(&self) -> &Space {
        self.ac_space.as_ref().unwrap_or_else(|| self.env.ac_space())
    }

    fn observe(&mut self) -> Result<Timestep> {
        match &mut self.observe {
            Some(f) => f(&mut self.env),
            None => self.env.observe(),
        }
    }

    fn act(&mut self, ac: &Value) -> Result<()> {
        match &mut self.act {
            Some(f) => f(&mut self.env, ac),
            None => self.env.act(ac),
        }
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        match &mut self.get_info {
            Some(f) => f(&mut self.env),
            None => self.env.get_info(),
        }
    }

    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        if self.methods.contains(name) {
            let num = self.env.num();
            self.methods.call(&mut self.env, num, name, args)
        } else {
            self.env.callmethod(name, args)
        }
    }

    fn method_names(&self) -> Vec<String> {
        let mut names = self.methods.names();
        names.extend(self.env.method_names());
        names.sort();
        names.dedup();
        names
    }

    fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name) || self.env.has_method(name)
    }

    fn inner_env(&self) -> Option<EnvRef<'_>> { Some(EnvRef::Borrowed(&self.env)) }
    fn close(&mut self) -> Result<()> { self.env.close() }
}

/// Tracks per-index return and length, reporting them in `get_info`.
///
/// On the observation where an index starts a new episode, that index's info
/// gains `episode_return` (f64) and `episode_length` (i64) for the episode
/// that just ended.
pub struct EpisodeStatistics<E: Env> {
    env: E,
    ep_return: Vec<f64>,
    ep_length: Vec<i64>,
    completed: Vec<Option<(f64, i64)>>,
}

impl<E: Env> EpisodeStatistics<E> {
    pub fn new(env: E) -> Self {
        let n = env.num();
        Self { env, ep_return: vec![0.0; n], ep_length: vec![0; n], completed: vec![None; n] }
    }

    pub fn inner(&self) -> &E { &self.env }
    pub fn into_inner(self) -> E { self.env }
}

impl<E: Env> Env for EpisodeStatistics<E> {
    fn num(&self) -> usize { self.env.num() }
    fn ob_space(&self) -> &Space { self.env.ob_space() }
    fn ac_space(&self) -> &Space { self.env.ac_space() }
    fn observe(&mut self) -> Result<Timestep> { self.env.observe() }

    fn act(&mut self, ac: &Value) -> Result<()> {
        self.env.act(ac)?;
        let ts = self.env.observe()?;
        for i in 0..self.ep_return.len() {
            self.ep_return[i] += ts.reward[i] as f64;
            self.ep_length[i] += 1;
            if ts.first[i] {
                self.completed[i] = Some((self.ep_return[i], self.ep_length[i]));
                self.ep_return[i] = 0.0;
                self.ep_length[i] = 0;
            } else {
                self.completed[i] = None;
            }
        }
        Ok(())
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        let mut infos = self.env.get_info()?;
        for (info, done) in infos.iter_mut().zip(&self.completed) {
            if let Some((ret, len)) = done {
                info.insert("episode_return", InfoValue::from(*ret));
                info.insert("episode_length", InfoValue::from(*len));
            }
        }
        Ok(infos)
    }

    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        self.env.callmethod(name, args)
    }

    fn method_names(&self) -> Vec<String> { self.env.method_names() }
    fn has_method(&self, name: &str) -> bool { self.env.has_method(name) }
    fn inner_env(&self) -> Option<EnvRef<'_>> { Some(EnvRef::Borrowed(&self.env)) }
    fn close(&mut self) -> Result<()> { self.env.close() }
}

/// Replaces an aggregate observation by one of its entries.
pub struct ExtractDictOb<E: Env> {
    env: E,
    key: String,
    ob_space: Space,
}

impl<E: Env> ExtractDictOb<E> {
    pub fn new(env: E, key: &str) -> Result<Self> {
        let ob_space = match env.ob_space() {
            Space::Dict(d) => d.get(key).cloned(),
            Space::Tensor(_) => None,
        }
        .ok_or_else(|| EnvError::SpaceMismatch(format!("observation space has no entry {key:?}")))?;
        Ok(Self { env, key: key.to_string(), ob_space })
    }
}

impl<E: Env> Env for ExtractDictOb<E> {
    fn num(&self) -> usize { self.env.num() }
    fn ob_space(&self) -> &Space { &self.ob_space }
    fn ac_space(&self) -> &Space { self.env.ac_space() }

    fn observe(&mut self) -> Result<Timestep> {
        let mut ts = self.env.observe()?;
        ts.ob = ts
            .ob
            .get(&self.key)
            .cloned()
            .ok_or_else(|| EnvError::SpaceMismatch(format!("observation has no entry {:?}", self.key)))?;
        Ok(ts)
    }

    fn act(&mut self, ac: &Value) -> Result<()> { self.env.act(ac) }
    fn get_info(&mut self) -> Result<Vec<Info>> { self.env.get_info() }

    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        self.env.callmethod(name, args)
    }

    fn method_names(&self) -> Vec<String> { self.env.method_names() }
    fn has_method(&self, name: &str) -> bool { self.env.has_method(name) }
    fn inner_env(&self) -> Option<EnvRef<'_>> { Some(EnvRef::Borrowed(&self.env)) }
    fn close(&mut self) -> Result<()> { self.env.close() }
}

/// Checks every action and timestep against the declared spaces.
pub struct AssertSpaces<E: Env> {
    env: E,
}

impl<E: Env> AssertSpaces<E> {
    pub fn new(env: E) -> Self { Self { env } }
}

impl<E: Env> Env for AssertSpaces<E> {
    fn num(&self) -> usize { self.env.num() }
    fn ob_space(&self) -> &Space { self.env.ob_space() }
    fn ac_space(&self) -> &Space { self.env.ac_space() }

    fn observe(&mut self) -> Result<Timestep> {
        let ts = self.env.observe()?;
        ts.validate(self.env.num(), self.env.ob_space())?;
        Ok(ts)
    }

    fn act(&mut self, ac: &Value) -> Result<()> {
        check_action(self.env.ac_space(), ac, self.env.num())?;
        self.env.act(ac)
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        let infos = self.env.get_info()?;
        if infos.len() != self.env.num() {
            return Err(EnvError::SpaceMismatch(format!(
                "get_info returned {} records for {} indices",
                infos.len(),
                self.env.num()
            )));
        }
        Ok(infos)
    }

    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        self.env.callmethod(name, args)
    }

    fn method_names(&self) -> Vec<String> { self.env.method_names() }
    fn has_method(&self, name: &str) -> bool { self.env.has_method(name) }
    fn inner_env(&self) -> Option<EnvRef<'_>> { Some(EnvRef::Borrowed(&self.env)) }
    fn close(&mut self) -> Result<()> { self.env.close() }
}
