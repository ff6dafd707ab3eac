//! Shared helpers: id generation, JSON path utilities, and scripted test
//! doubles for the runner/store boundaries.

pub mod id_generator;
pub mod json_ext;
pub mod testing;
