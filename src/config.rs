//! Process-wide tunables.
//!
//! Tasks are single-threaded by construction, so "process-wide" state
//! lives in thread-locals: each simulated task sees its own copy, the
//! same way each MPI rank owns its own globals. Reads are lock-free;
//! writes are assumed quiescent (a changed buffer limit only applies to
//! files opened after the change, which snapshot it at creation).

use std::cell::Cell;

/// Default compute-side write cache limit: 10 MiB.
pub const DEFAULT_BUFFER_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// Default cap on the projected number of non-contiguous I/O-side
/// regions a single flush may hand the backend. Parallel backends
/// degrade badly past tens of thousands of sub-array requests.
pub const DEFAULT_MAX_CACHED_IO_REGIONS: usize = 65536;

/// Flow-control ceiling for the controlled gather in the exchange
/// engine.
pub const MAX_GATHER_BLOCK_SIZE: usize = 64;

/// Default size of the integrated buffer-pool arena: 64 MiB.
pub const DEFAULT_POOL_CAPACITY: usize = 64 * 1024 * 1024;

thread_local! {
    static BUFFER_SIZE_LIMIT: Cell<usize> = const { Cell::new(DEFAULT_BUFFER_SIZE_LIMIT) };
    static MAX_CACHED_IO_REGIONS: Cell<usize> = const { Cell::new(DEFAULT_MAX_CACHED_IO_REGIONS) };
}

/// Set the compute-side write cache limit in bytes.
///
/// Returns the previous limit. A value of zero leaves the limit
/// unchanged (the previous value is still returned). The new limit only
/// applies to files opened after the change.
pub fn set_buffer_size_limit(limit: usize) -> usize {
    BUFFER_SIZE_LIMIT.with(|l| {
        let old = l.get();
        if limit > 0 {
            l.set(limit);
        }
        old
    })
}

/// Current compute-side write cache limit in bytes.
pub fn buffer_size_limit() -> usize {
    BUFFER_SIZE_LIMIT.with(Cell::get)
}

/// Set the cap on projected I/O-side regions per flush.
///
/// Returns the previous cap. Exceeding the cap forces a disk flush
/// before the next append (see the flush controller).
pub fn set_max_cached_io_regions(cap: usize) -> usize {
    MAX_CACHED_IO_REGIONS.with(|c| {
        let old = c.get();
        if cap > 0 {
            c.set(cap);
        }
        old
    })
}

/// Current cap on projected I/O-side regions per flush.
pub fn max_cached_io_regions() -> usize {
    MAX_CACHED_IO_REGIONS.with(Cell::get)
}

/// Tuning knobs for the collective exchange engine, carried by the
/// I/O system and applied to every rearrangement.
#[derive(Debug, Clone, Copy)]
pub struct RearrOpts {
    /// Receiver pre-announces readiness so the sender can issue a
    /// synchronous ready-send.
    pub handshake: bool,
    /// Use non-blocking sends.
    pub isend: bool,
    /// Upper bound on simultaneously outstanding receives; 0 means
    /// unbounded.
    pub max_requests: usize,
}

impl Default for RearrOpts {
    fn default() -> Self {
        Self {
            handshake: true,
            isend: false,
            max_requests: 64,
        }
    }
}
