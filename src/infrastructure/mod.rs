//! Infrastructure layer for filesystem and environment interactions.

pub mod paths;

pub use paths::{default_buffer_path, get_data_dir};
