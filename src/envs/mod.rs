pub mod cart_pole;
pub mod identity;

pub use cart_pole::CartPole;
pub use identity::IdentityEnv;
