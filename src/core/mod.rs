//! Core data types and I/O operations.

pub mod codebook;
pub mod loaders;
pub mod stack;
pub mod synthetic;
pub mod transforms;
pub mod writers;

pub use codebook::{Codebook, CodebookEntry, CodebookError};
pub use loaders::{load_fov, FieldOfView, LoaderError};
pub use stack::{Axis, ImageStack, StackError};
pub use writers::{write_decoded_csv, write_spot_table_csv, write_stack_tiles, WriteError};
