use std::sync::Arc;

use rand::Rng;

use crate::core::{
    CallArgs, Env, EnvError, Info, InfoValue, MethodTable, Methods, Result, Timestep, check_action,
};
use crate::spaces::{Space, Tensor, Value};
use crate::utils::rng::{RngStream, SeedSequence};

/// Rewards the agent for repeating the current observation.
///
/// Each index observes a random integer in `[0, n)` and receives reward 1.0
/// when its next action equals that integer. Episodes last `episode_len` steps.
pub struct IdentityEnv {
    num: usize,
    n: u32,
    episode_len: u32,
    target: Vec<i64>,
    steps: Vec<u32>,
    reward: Vec<f32>,
    first: Vec<bool>,
    rngs: Vec<RngStream>,
    space: Space,
    methods: Methods<IdentityEnv>,
}

impl IdentityEnv {
    pub fn new(num: usize, n: u32, episode_len: u32, seed: u64) -> Result<Self> {
        if num == 0 || episode_len == 0 {
            return Err(EnvError::SpaceDefinition("num and episode_len must be positive".into()));
        }
        let space = Space::discrete(n)?;
        let mut rngs = SeedSequence::new(seed).streams(num);
        let target = rngs.iter_mut().map(|r| r.gen_range(0..n as i64)).collect();
        Ok(Self {
            num,
            n,
            episode_len,
            target,
            steps: vec![0; num],
            reward: vec![0.0; num],
            first: vec![true; num],
            rngs,
            space,
            methods: Arc::new(Self::methods()),
        })
    }

    fn methods() -> MethodTable<IdentityEnv> {
        MethodTable::new()
            .with_per_index("echo", |_env: &mut IdentityEnv, _i, row| {
                Ok(row.args.into_iter().next().unwrap_or(InfoValue::Null))
            })
            .with_per_index("echo_kw", |_env: &mut IdentityEnv, _i, row| {
                Ok(row.kwargs.get("value").cloned().unwrap_or(InfoValue::Null))
            })
            .with_per_index("target", |env: &mut IdentityEnv, i, _row| Ok(InfoValue::I64(env.target[i])))
    }

    /// Current targets, one per index.
    pub fn targets(&self) -> &[i64] {
        &self.target
    }
}

impl Env for IdentityEnv {
    fn num(&self) -> usize { self.num }
    fn ob_space(&self) -> &Space { &self.space }
    fn ac_space(&self) -> &Space { &self.space }

    fn observe(&mut self) -> Result<Timestep> {
        let ob = Tensor::from_vec(vec![self.num], self.target.clone())?;
        Ok(Timestep::new(self.reward.clone(), Value::Tensor(ob), self.first.clone()))
    }

    fn act(&mut self, ac: &Value) -> Result<()> {
        check_action(&self.space, ac, self.num)?;
        let ac = ac
            .as_tensor()
            .and_then(|t| t.as_slice::<i64>())
            .ok_or_else(|| EnvError::SpaceMismatch("expected int64 actions".into()))?;
        for i in 0..self.num {
            self.reward[i] = if ac[i] == self.target[i] { 1.0 } else { 0.0 };
            self.steps[i] += 1;
            self.first[i] = self.steps[i] >= self.episode_len;
            if self.first[i] {
                self.steps[i] = 0;
            }
            self.target[i] = self.rngs[i].gen_range(0..self.n as i64);
        }
        Ok(())
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        Ok(self
            .steps
            .iter()
            .map(|&s| {
                let mut info = Info::new();
                info.insert("step", InfoValue::from(s as i64));
                info
            })
            .collect())
    }

    fn callmethod(&mut self, name: &str, args: &CallArgs) -> Result<Vec<InfoValue>> {
        let methods = Arc::clone(&self.methods);
        methods.call(self, self.num, name, args)
    }

    fn method_names(&self) -> Vec<String> { self.methods.names() }
    fn has_method(&self, name: &str) -> bool { self.methods.contains(name) }
}
