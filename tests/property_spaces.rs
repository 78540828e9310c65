use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use vecgym::{DType, Space, TensorSpace, Value};

fn dtype() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::F32),
        Just(DType::F64),
        Just(DType::I32),
        Just(DType::I64),
        Just(DType::Bool),
        Just(DType::U8),
    ]
}

// A tensor space with optional uniform bounds that always include zero.
fn tensor_space() -> impl Strategy<Value = Space> {
    (proptest::collection::vec(1usize..4, 0..3), dtype(), any::<bool>(), 0u32..50, 0u32..50).prop_map(
        |(shape, dtype, bounded, below, above)| {
            let s = TensorSpace::new(shape, dtype).unwrap();
            if !bounded {
                return s.into();
            }
            let (lo, hi) = match dtype {
                DType::Bool => (0.0, 1.0),
                DType::U8 => (0.0, above as f64),
                DType::F32 | DType::F64 => (-(below as f64) * 0.5, above as f64 * 0.25),
                DType::I32 | DType::I64 => (-(below as f64), above as f64),
            };
            s.with_uniform_bounds(lo, hi).unwrap().into()
        },
    )
}

fn space() -> impl Strategy<Value = Space> {
    tensor_space().prop_recursive(2, 8, 3, |inner| {
        proptest::collection::btree_map("[a-z]{1,4}", inner, 1..4)
            .prop_map(|entries| Space::dict(entries).unwrap())
    })
}

proptest! {
    // Samples and zeros are members; sampling is deterministic per seed
    #[test]
    fn sample_and_zero_are_members(space in space(), seed in any::<u64>()) {
        let mut rng1 = StdRng::seed_from_u64(seed);
        let mut rng2 = StdRng::seed_from_u64(seed);
        for _ in 0..20 {
            let v1 = space.sample(&mut rng1);
            let v2 = space.sample(&mut rng2);
            prop_assert!(space.contains(&v1));
            prop_assert_eq!(v1, v2);
        }
        prop_assert!(space.contains(&space.zero()));
    }

    // Batched samples respect the leading dimension
    #[test]
    fn batches_are_members(space in space(), num in 1usize..6, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let batch = space.sample_batch(&mut rng, num).unwrap();
        prop_assert!(space.contains_batch(&batch, num));
        prop_assert!(!space.contains_batch(&batch, num + 1));
        prop_assert_eq!(batch.batch_len().unwrap(), num);
        prop_assert!(space.contains_batch(&space.zero_batch(num).unwrap(), num));
    }

    // Rows of a batch are members of the unbatched space
    #[test]
    fn rows_are_members(space in space(), num in 1usize..5, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let batch = space.sample_batch(&mut rng, num).unwrap();
        for i in 0..num {
            prop_assert!(space.contains(&batch.row(i).unwrap()));
        }
    }

    // Splitting a batch at any point and concatenating restores it
    #[test]
    fn split_then_concat_is_identity(space in space(), num in 2usize..8, cut in 1usize..7, seed in any::<u64>()) {
        let cut = cut.min(num - 1);
        let mut rng = StdRng::seed_from_u64(seed);
        let batch = space.sample_batch(&mut rng, num).unwrap();
        let parts = vec![batch.slice(0..cut).unwrap(), batch.slice(cut..num).unwrap()];
        prop_assert_eq!(Value::concat(&parts).unwrap(), batch);
    }

    // Leaves are reported in sorted order and one per tensor
    #[test]
    fn leaves_are_sorted(space in space(), seed in any::<u64>()) {
        let leaves = space.leaves();
        let names: Vec<&String> = leaves.iter().map(|(k, _)| k).collect();
        let mut sorted = names.clone();
        sorted.sort();
        prop_assert_eq!(&names, &sorted);
        let mut rng = StdRng::seed_from_u64(seed);
        prop_assert_eq!(space.sample(&mut rng).leaves().len(), leaves.len());
    }
}

#[test]
fn bounded_float_box_from_example() {
    let space = Space::boxed(vec![4], -1.0, 1.0).unwrap();
    let mut rng = StdRng::seed_from_u64(12345);
    for _ in 0..1000 {
        assert!(space.contains(&space.sample(&mut rng)));
    }
    assert!(space.contains(&space.zero()));
}
