// Concatenating several batched environments into one larger batch.

use std::ops::Range;

use log::debug;

use crate::core::{CallArgs, Env, EnvError, Info, InfoValue, Result, Timestep, check_action};
use crate::spaces::{Space, Value};

/// Runs several envs behind one handle, in the current thread.
///
/// - Construct with `ConcatEnv::new(vec![Box::new(a), Box::new(b)])`
/// - Index `j` of the combined batch belongs to the child whose contiguous
///   range contains `j`, in child order.
/// - Children must declare identical `ob_space` and `ac_space`.
pub struct ConcatEnv {
    envs: Vec<Box<dyn Env>>,
    ranges: Vec<Range<usize>>,
    num: usize,
    ob_space: Space,
    ac_space: Space,
}

impl ConcatEnv {
    pub fn new(envs: Vec<Box<dyn Env>>) -> Result<Self> {
        let first = envs
            .first()
            .ok_or_else(|| EnvError::SpaceDefinition("ConcatEnv needs at least one child".into()))?;
        let ob_space = first.ob_space().clone();
        let ac_space = first.ac_space().clone();

        let mut ranges = Vec::with_capacity(envs.len());
        let mut start = 0;
        for (i, env) in envs.iter().enumerate() {
            if env.ob_space() != &ob_space {
                return Err(EnvError::SpaceMismatch(format!("child {i} declares a different ob_space")));
            }
            if env.ac_space() != &ac_space {
                return Err(EnvError::SpaceMismatch(format!("child {i} declares a different ac_space")));
            }
            ranges.push(start..start + env.num());
            start += env.num();
        }
        debug!("concatenated {} envs into num={start}", envs.len());
        Ok(Self { envs, ranges, num: start, ob_space, ac_space })
    }

    /// Number of child envs.
    pub fn len(&self) -> usize { self.envs.len() }
    pub fn is_empty(&self) -> bool { self.envs.is_empty() }

    /// Batch range owned by each child.
    pub fn ranges(&self) -> &[Range<usize>] { &self.ranges }

    pub fn envs(&self) -> &[Box<dyn Env>] { &self.envs }
    pub fn envs_mut(&mut self) -> &mut [Box<dyn Env>] { &mut self.envs }

    pub fn into_envs(self) -> Vec<Box<dyn Env>> { self.envs }
}

impl Env for ConcatEnv {
    fn num(&self) -> usize { self.num }
    fn ob_space(&self) -> &Space { &self.ob_space }
    fn ac_space(&self) -> &Space { &self.ac_space }

    fn observe(&mut self) -> Result<Timestep> {
        let parts = self.envs.iter_mut().map(|e| e.observe()).collect::<Result<Vec<_>>>()?;
        Timestep::concat(&parts)
    }

    fn act(&mut self, ac: &Value) -> Result<()> {
        // Validate the whole batch before any child steps.
        check_action(&self.ac_space, ac, self.num)?;
        let slices = self.ranges.iter().map(|r| ac.slice(r.clone())).collect::<Result<Vec<_>>>()?;
        for (env, slice) in self.envs.iter_mut().zip(&slices) {
            env.act(slice)?;
        }
        Ok(())
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        let mut out = Vec::with_capacity(self.num);
        for env in &mut self.envs {
            out.extend(env.get_info()?);
        }
        Ok(out)
    }

    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        if let Some(i) = self.envs.iter().position(|e| !e.has_method(name)) {
            debug!("child {i} has no method {name:?}");
            return Err(EnvError::MethodNotFound(name.to_string()));
        }
        args.check_len(self.num)?;
        let mut out = Vec::with_capacity(self.num);
        for (env, r) in self.envs.iter_mut().zip(&self.ranges) {
            out.extend(env.callmethod(name, &args.slice(r.clone()))?);
        }
        Ok(out)
    }

    fn method_names(&self) -> Vec<String> {
        let mut names = self.envs[0].method_names();
        names.retain(|n| self.envs[1..].iter().all(|e| e.has_method(n)));
        names
    }

    fn has_method(&self, name: &str) -> bool {
        self.envs.iter().all(|e| e.has_method(name))
    }

    fn close(&mut self) -> Result<()> {
        // Close every child even if an earlier one fails; report the first error.
        let mut first_err = None;
        for env in &mut self.envs {
            if let Err(e) = env.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
