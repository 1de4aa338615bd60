//! Memory management for pario.
//!
//! Every task owns one [`BufferPool`], shared by all of that task's open
//! files. The pool backs the compute-side write cache and the transient
//! I/O-side scratch buffers, and its live statistics (notably the
//! largest contiguous free block) drive the flush controller.
//!
//! # Architecture
//!
//! - [`BufferPool`]: acquire/grow/release over a contiguous slab arena
//!   (default) or the system allocator (`system-alloc` feature)
//! - [`PoolBlock`]: RAII guard; the extent returns to the pool on drop,
//!   so every early-return path releases what it acquired
//! - [`PoolStats`]: current allocation, total free, largest free block,
//!   and lifetime get/release counters

mod pool;

pub use pool::{BufferPool, PoolBlock, PoolKind, PoolStats};
