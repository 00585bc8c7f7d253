//! Filesystem helpers: traversal, copies and ownership.

pub mod copy;
pub mod metadata;
pub mod walker;

pub use copy::{clear_dir, copy_tree, write_atomic};
pub use metadata::Ownership;
pub use walker::{calculate_total_size, walk_directory, FileInfo, WalkOptions};
