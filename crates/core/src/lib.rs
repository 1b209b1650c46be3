//! Core crate for the image-to-tensor conversion kernel and its host harness.

pub mod codegen;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod logging;
pub mod node;
pub mod registry;
pub mod types;
