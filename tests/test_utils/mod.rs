pub mod fixtures;

pub use fixtures::{Engine, engine, read_fragment};
