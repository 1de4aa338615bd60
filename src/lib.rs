//! # pario
//!
//! A parallel I/O library for distributed scientific arrays.
//!
//! Applications run on a set of *compute tasks*, each owning a local
//! tile of a global logical array. pario aggregates written tiles in a
//! compute-side cache, rearranges them so that a smaller set of *I/O
//! tasks* each write a few large contiguous regions, and hands those
//! regions to a pluggable file-format backend.
//!
//! ## Features
//!
//! - **Write aggregation**: per-file write-multi-buffers queue payloads
//!   until a collectively agreed flush drains them
//! - **Two rearrangers**: dense `Box` and sparse `Subset` (with hole
//!   fill-up) layouts between compute and I/O tasks
//! - **Windowed exchange engine**: hypercube pair schedule, optional
//!   handshake and non-blocking sends, bounded outstanding requests
//! - **Buffer pool**: slab allocator with live stats that drive the
//!   flush heuristics
//! - **Async systems**: disjoint compute and I/O groups, with write
//!   calls shipped to the I/O side as messages
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pario::prelude::*;
//!
//! // One rank that both computes and does I/O.
//! let mut unions = Fabric::world(1);
//! let mut ioc = Fabric::world(1);
//! let mut ios = IoSystem::intracomm(unions.remove(0), Some(ioc.remove(0)), 1);
//!
//! let ioid = ios.define_decomp(IoDesc::block(100, 1, 1, Some(0), Some(0), ElemType::F64));
//! let store = MemStore::new();
//! let mut file = File::create(&ios, 0, IoType::SerialV3, Mode::Write,
//!     Box::new(MemBackend::new(store.clone(), IoType::SerialV3)));
//! let v = file.def_var(ElemType::F64, 1);
//!
//! let data: Vec<u8> = (0..100).flat_map(|i| (i as f64).to_ne_bytes()).collect();
//! write_darray(&mut ios, &mut file, v, ioid, 100, &data, None)?;
//! file.close(&mut ios)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod comm;
pub mod config;
pub mod darray;
pub mod decomp;
pub mod dispatch;
pub mod dtype;
pub mod error;
pub mod file;
pub mod flush;
pub mod iosystem;
pub mod memory;
pub mod rearrange;
pub mod wmb;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{Backend, IoType, MemBackend, MemStore, WriteMode};
    pub use crate::comm::Fabric;
    pub use crate::config::set_buffer_size_limit;
    pub use crate::darray::{read_darray, write_darray, write_darray_multi};
    pub use crate::decomp::{IoDesc, Rearranger};
    pub use crate::dtype::ElemType;
    pub use crate::error::{Error, Result};
    pub use crate::file::{File, Mode};
    pub use crate::iosystem::IoSystem;
    pub use crate::memory::BufferPool;
}

pub use error::{Error, Result};
