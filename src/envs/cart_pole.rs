use std::sync::Arc;

use log::debug;
use rand::distributions::{Distribution, Uniform};

use crate::core::{
    CallArgs, Env, EnvError, Info, InfoValue, MethodTable, Methods, Result, Timestep, check_action,
};
use crate::spaces::{DType, Space, Tensor, TensorData, TensorSpace, Value};
use crate::utils::rng::{RngStream, SeedSequence};

const GRAVITY: f32 = 9.8;
const MASSCART: f32 = 1.0;
const MASSPOLE: f32 = 0.1;
const TOTAL_MASS: f32 = MASSCART + MASSPOLE;
// Half the pole's length.
const LENGTH: f32 = 0.5;
const POLEMASS_LENGTH: f32 = MASSPOLE * LENGTH;
const FORCE_MAG: f32 = 10.0;
const TAU: f32 = 0.02;
const X_THRESHOLD: f32 = 2.4;

/// Batched cart-pole balancing.
///
/// Observation per index: `[x, x_dot, theta, theta_dot]` (float32).
/// Action per index: int64 in `{0: push left, 1: push right}`.
/// Reward: 1.0 per step. An index resets itself when the pole falls, the cart
/// leaves the track, or `max_episode_steps` is reached; the observation after
/// a reset carries `first = true`.
pub struct CartPole {
    num: usize,
    state: Vec<[f32; 4]>,
    steps: Vec<u32>,
    reward: Vec<f32>,
    first: Vec<bool>,
    rngs: Vec<RngStream>,
    pub max_episode_steps: u32,
    theta_threshold_radians: f32,
    ob_space: Space,
    ac_space: Space,
    methods: Methods<CartPole>,
}

impl CartPole {
    pub fn new(num: usize, seed: u64) -> Result<Self> {
        if num == 0 {
            return Err(EnvError::SpaceDefinition("num must be positive".into()));
        }
        let big = f32::MAX as f64;
        let ob_space = TensorSpace::new(vec![4], DType::F32)?
            .with_bounds(vec![-4.8, -big, -0.42, -big], vec![4.8, big, 0.42, big])?
            .into();
        let mut env = Self {
            num,
            state: vec![[0.0; 4]; num],
            steps: vec![0; num],
            reward: vec![0.0; num],
            first: vec![true; num],
            rngs: SeedSequence::new(seed).streams(num),
            max_episode_steps: 500,
            theta_threshold_radians: 12.0_f32.to_radians(),
            ob_space,
            ac_space: Space::discrete(2)?,
            methods: Arc::new(Self::methods()),
        };
        for i in 0..num {
            env.reset_index(i);
        }
        Ok(env)
    }

    fn methods() -> MethodTable<CartPole> {
        MethodTable::new()
            .with("get_state", |env: &mut CartPole, _args: &CallArgs| {
                Ok(env
                    .state
                    .iter()
                    .map(|s| InfoValue::Tensor(Tensor::from_parts(vec![4], TensorData::F32(s.to_vec()))))
                    .collect())
            })
            .with_per_index("set_state", |env: &mut CartPole, i, row| {
                let s = row
                    .args
                    .first()
                    .and_then(|a| match a {
                        InfoValue::Tensor(t) => t.as_slice::<f32>().map(<[f32]>::to_vec),
                        _ => None,
                    })
                    .filter(|v| v.len() == 4)
                    .ok_or_else(|| EnvError::SpaceMismatch("set_state expects a float32 tensor of 4".into()))?;
                env.state[i] = [s[0], s[1], s[2], s[3]];
                Ok(InfoValue::Null)
            })
    }

    fn reset_index(&mut self, i: usize) {
        let uni = Uniform::new_inclusive(-0.05f32, 0.05f32);
        let rng = &mut self.rngs[i];
        self.state[i] = [uni.sample(rng), uni.sample(rng), uni.sample(rng), uni.sample(rng)];
        self.steps[i] = 0;
        self.first[i] = true;
    }

    fn terminated(&self, i: usize) -> bool {
        let [x, _, theta, _] = self.state[i];
        !(-X_THRESHOLD..=X_THRESHOLD).contains(&x)
            || !(-self.theta_threshold_radians..=self.theta_threshold_radians).contains(&theta)
    }

    fn step_index(&mut self, i: usize, action: i64) {
        let [x, x_dot, theta, theta_dot] = self.state[i];
        let force = if action == 1 { FORCE_MAG } else { -FORCE_MAG };
        let (sin_theta, cos_theta) = theta.sin_cos();

        let temp = (force + POLEMASS_LENGTH * theta_dot.powi(2) * sin_theta) / TOTAL_MASS;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (LENGTH * (4.0 / 3.0 - MASSPOLE * cos_theta.powi(2) / TOTAL_MASS));
        let x_acc = temp - POLEMASS_LENGTH * theta_acc * cos_theta / TOTAL_MASS;

        // Euler integration
        self.state[i] = [
            x + TAU * x_dot,
            x_dot + TAU * x_acc,
            theta + TAU * theta_dot,
            theta_dot + TAU * theta_acc,
        ];
        self.steps[i] += 1;
        self.reward[i] = 1.0;
        self.first[i] = false;

        if self.terminated(i) || self.steps[i] >= self.max_episode_steps {
            debug!("cartpole index {i} episode ended after {} steps", self.steps[i]);
            self.reset_index(i);
        }
    }
}

impl Env for CartPole {
    fn num(&self) -> usize { self.num }
    fn ob_space(&self) -> &Space { &self.ob_space }
    fn ac_space(&self) -> &Space { &self.ac_space }

    fn observe(&mut self) -> Result<Timestep> {
        let flat: Vec<f32> = self.state.iter().flatten().copied().collect();
        let ob = Tensor::from_vec(vec![self.num, 4], flat)?;
        Ok(Timestep::new(self.reward.clone(), Value::Tensor(ob), self.first.clone()))
    }

    fn act(&mut self, ac: &Value) -> Result<()> {
        check_action(&self.ac_space, ac, self.num)?;
        let actions = ac
            .as_tensor()
            .and_then(|t| t.as_slice::<i64>())
            .map(<[i64]>::to_vec)
            .ok_or_else(|| EnvError::SpaceMismatch("expected int64 actions".into()))?;
        for (i, a) in actions.into_iter().enumerate() {
            self.step_index(i, a);
        }
        Ok(())
    }

    fn get_info(&mut self) -> Result<Vec<Info>> {
        Ok(self
            .steps
            .iter()
            .map(|&s| {
                let mut info = Info::new();
                info.insert("steps", InfoValue::from(s as i64));
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
