//! Trait interfaces between the tree, the engines and operator kernels.
pub mod fmm;
pub mod kernel;
pub mod types;
