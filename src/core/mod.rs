//! Core data types and I/O operations.

pub mod loaders;
pub mod pickle;
pub mod transforms;
pub mod writers;

pub use loaders::{load_obj, LoaderError, ObjMesh};
pub use writers::{copy_materials, write_obj, WriteError};
