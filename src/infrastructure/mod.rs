// Infrastructure implementations for Haystack.

pub mod concurrency;
pub mod generator_runner;
pub mod graph_store;

pub use generator_runner::{GeneratorOptions, GeneratorRunner};
pub use graph_store::FsGraphStore;
