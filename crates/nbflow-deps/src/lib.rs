pub mod analyzer;
pub mod graph;

pub use analyzer::{analyze, Analysis};
pub use graph::{DependencyGraph, GraphError};
