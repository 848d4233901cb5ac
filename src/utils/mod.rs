//! Shared utilities: atomic filesystem operations and progress display.

pub mod fs;
pub mod progress;

pub use fs::{DirStats, atomic_copy, atomic_write, copy_dir, dir_stats, ensure_dir, human_bytes};
