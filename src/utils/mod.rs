pub mod rng;

pub use rng::{RngStream, SeedSequence, split_n};
