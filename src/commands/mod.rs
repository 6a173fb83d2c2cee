//! Operation entry points, one module per CLI domain.

pub mod container;
pub mod k8s;
pub mod system;
