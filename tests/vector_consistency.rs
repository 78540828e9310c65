use vecgym::{
    AsynchronousWrapper, CartPole, ConcatEnv, Env, EnvError, EpisodeStatistics, IdentityEnv, Tensor, Timestep, Value,
};

fn actions(v: Vec<i64>) -> Value {
    let n = v.len();
    Value::Tensor(Tensor::from_vec(vec![n], v).unwrap())
}

// A ConcatEnv of one child produces the same rollout as the child alone
// when seeds and actions are the same.
#[test]
fn single_vs_concat_of_one_same_rollout() {
    let mut single = CartPole::new(1, 0).unwrap();
    let mut concat = ConcatEnv::new(vec![Box::new(CartPole::new(1, 0).unwrap())]).unwrap();
    assert_eq!(single.observe().unwrap(), concat.observe().unwrap());

    for a in [1, 1, 0, 1, 0, 0, 1, 1, 1, 0] {
        single.act(&actions(vec![a])).unwrap();
        concat.act(&actions(vec![a])).unwrap();
        assert_eq!(single.observe().unwrap(), concat.observe().unwrap());
        assert_eq!(single.get_info().unwrap(), concat.get_info().unwrap());
    }
}

// Each index of the combined batch tracks the matching child, in order.
#[test]
fn concat_matches_children_in_order() {
    let mut a = CartPole::new(2, 7).unwrap();
    let mut b = CartPole::new(3, 8).unwrap();
    let mut concat =
        ConcatEnv::new(vec![Box::new(CartPole::new(2, 7).unwrap()), Box::new(CartPole::new(3, 8).unwrap())]).unwrap();
    assert_eq!(concat.num(), 5);

    for step in 0..40i64 {
        let ac: Vec<i64> = (0..5).map(|i| (step + i) % 2).collect();
        concat.act(&actions(ac.clone())).unwrap();
        a.act(&actions(ac[..2].to_vec())).unwrap();
        b.act(&actions(ac[2..].to_vec())).unwrap();
        let expect = Timestep::concat(&[a.observe().unwrap(), b.observe().unwrap()]).unwrap();
        let got = concat.observe().unwrap();
        got.validate(5, concat.ob_space()).unwrap();
        assert_eq!(got, expect);
    }
}

// Running the same env behind an AsynchronousWrapper changes nothing observable.
#[test]
fn async_matches_sync_rollout() {
    let mut sync = EpisodeStatistics::new(CartPole::new(3, 1).unwrap());
    let mut asy = AsynchronousWrapper::new(EpisodeStatistics::new(CartPole::new(3, 1).unwrap())).unwrap();
    for step in 0..60i64 {
        let ac = actions(vec![step % 2, 1, 0]);
        sync.act(&ac).unwrap();
        asy.act(&ac).unwrap();
        assert_eq!(sync.observe().unwrap(), asy.observe().unwrap());
        assert_eq!(sync.get_info().unwrap(), asy.get_info().unwrap());
    }
}

// Asynchronous children compose under ConcatEnv.
#[test]
fn concat_of_async_children() {
    let children: Vec<Box<dyn Env>> = vec![
        Box::new(AsynchronousWrapper::new(IdentityEnv::new(1, 3, 4, 0).unwrap()).unwrap()),
        Box::new(AsynchronousWrapper::new(IdentityEnv::new(2, 3, 4, 1).unwrap()).unwrap()),
    ];
    let mut concat = ConcatEnv::new(children).unwrap();
    let mut plain = ConcatEnv::new(vec![
        Box::new(IdentityEnv::new(1, 3, 4, 0).unwrap()),
        Box::new(IdentityEnv::new(2, 3, 4, 1).unwrap()),
    ])
    .unwrap();
    for _ in 0..10 {
        let ts = plain.observe().unwrap();
        assert_eq!(ts, concat.observe().unwrap());
        // Echo the observation back: every index should be rewarded.
        let ac = ts.ob.clone();
        plain.act(&ac).unwrap();
        concat.act(&ac).unwrap();
        let after = concat.observe().unwrap();
        assert_eq!(after, plain.observe().unwrap());
        assert!(after.reward.iter().all(|&r| r == 1.0));
    }
    concat.close().unwrap();
    assert!(matches!(concat.act(&actions(vec![0, 0, 0])), Err(EnvError::Closed)));
}
