pub mod core;
pub mod spaces;
pub mod utils;
pub mod envs;
pub mod wrappers;
pub mod vector;
pub mod registry;
pub mod subproc;
pub mod libenv;

pub use crate::core::{CallArgs, Env, EnvError, ErrorKind, Info, InfoValue, MethodTable, Result, Timestep};
pub use crate::core::{chain_depth, with_base_env};
pub use crate::spaces::{DType, Space, Tensor, TensorData, TensorSpace, Value};
pub use crate::envs::{CartPole, IdentityEnv};
pub use crate::wrappers::{AssertSpaces, AsynchronousWrapper, EpisodeStatistics, ExtractDictOb, Wrapper};
pub use crate::vector::ConcatEnv;
pub use crate::registry::{EnvSpec, make, register};
pub use crate::subproc::{SubprocConfig, SubprocEnv};
pub use crate::libenv::{LibEnv, LibEnvOptions};

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// A tiny batched env to validate the trait's default methods.
    struct CounterEnv {
        state: Vec<i64>,
        first: Vec<bool>,
        space: Space,
    }

    impl CounterEnv {
        fn new(num: usize) -> Self {
            Self { state: vec![0; num], first: vec![true; num], space: Space::discrete(3).unwrap() }
        }
    }

    impl Env for CounterEnv {
        fn num(&self) -> usize { self.state.len() }
        fn ob_space(&self) -> &Space { &self.space }
        fn ac_space(&self) -> &Space { &self.space }

        fn observe(&mut self) -> Result<Timestep> {
            let ob = Tensor::from_vec(vec![self.state.len()], self.state.clone())?;
            Ok(Timestep::new(vec![0.0; self.state.len()], Value::Tensor(ob), self.first.clone()))
        }

        fn act(&mut self, ac: &Value) -> Result<()> {
            let ac = ac.as_tensor().and_then(|t| t.as_slice::<i64>()).ok_or_else(|| {
                EnvError::SpaceMismatch("expected int64 actions".into())
            })?;
            for (s, a) in self.state.iter_mut().zip(ac) {
                *s = (*s + a) % 3;
            }
            self.first.iter_mut().for_each(|f| *f = false);
            Ok(())
        }

        fn get_info(&mut self) -> Result<Vec<Info>> {
            Ok(vec![Info::new(); self.state.len()])
        }
    }

    #[test]
    fn dummy_env_runs() {
        let mut env = CounterEnv::new(2);
        let ts = env.observe().unwrap();
        assert_eq!(ts.first, vec![true, true]);
        env.act(&Value::Tensor(Tensor::from_vec(vec![2], vec![1i64, 2]).unwrap())).unwrap();
        let ts = env.observe().unwrap();
        ts.validate(2, env.ob_space()).unwrap();
        assert_eq!(ts.ob.as_tensor().unwrap().as_slice::<i64>().unwrap(), &[1, 2]);
        assert!(env.method_names().is_empty());
        assert!(matches!(env.callmethod("any", &CallArgs::new()), Err(EnvError::MethodNotFound(_))));
        assert!(env.inner_env().is_none());
        env.close().unwrap();
    }

    #[test]
    fn spaces_discrete_and_box() {
        let mut rng = StdRng::seed_from_u64(42);
        let d = Space::discrete(5).unwrap();
        let batch = d.sample_batch(&mut rng, 16).unwrap();
        assert!(d.contains_batch(&batch, 16));

        let b = Space::boxed(vec![3], -1.0, 1.0).unwrap();
        for _ in 0..100 {
            let v = b.sample(&mut rng);
            assert!(b.contains(&v));
        }
        assert!(b.contains(&b.zero()));
    }

    #[test]
    fn boxed_envs_are_envs() {
        let mut envs: Vec<Box<dyn Env>> = vec![
            Box::new(CartPole::new(2, 0).unwrap()),
            Box::new(AssertSpaces::new(IdentityEnv::new(1, 2, 5, 0).unwrap())),
        ];
        for env in &mut envs {
            let num = env.num();
            let ts = env.observe().unwrap();
            ts.validate(num, env.ob_space()).unwrap();
            assert_eq!(env.get_info().unwrap().len(), num);
        }
    }
}
