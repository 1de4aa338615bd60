//! The flush controller: when a write-multi-buffer must drain.

use crate::backend::IoType;
use crate::config;
use crate::decomp::IoDesc;
use crate::error::Result;
use crate::file::File;
use crate::iosystem::IoSystem;
use crate::wmb::WriteMultiBuffer;

/// What a pending append requires of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushNeed {
    /// Budget is fine; append in place.
    No = 0,
    /// Rearrange now and start the backend write, freeing the compute
    /// cache. I/O tasks may keep the rearranged data buffered.
    Io = 1,
    /// Rearrange and complete the backend write, freeing the I/O
    /// cache too.
    Disk = 2,
}

impl FlushNeed {
    /// Decode the reduced wire value.
    pub fn from_i32(v: i32) -> FlushNeed {
        match v {
            2 => FlushNeed::Disk,
            1 => FlushNeed::Io,
            _ => FlushNeed::No,
        }
    }
}

/// Decide, from local state only, whether appending `arraylen` more
/// elements to `wmb` requires a flush first.
///
/// Three triggers, strongest first:
/// - the pool's current allocation has reached the file's buffer
///   limit: complete a write to free both sides (`Disk`);
/// - the projected I/O-side region count would exceed the configured
///   cap, which parallel backends handle badly (`Disk`);
/// - the largest free block is within 1.1x of what the grown cache
///   would need, so the pool is close to exhausted (`Io`). The 1.1
///   slack factor is inherited; treat it as part of the contract.
///
/// The caller must reduce the answer across the compute communicator
/// before acting: flushing on local state alone deadlocks the
/// collective rearrangement downstream.
pub(crate) fn needs_flush(
    file: &File,
    wmb: &WriteMultiBuffer,
    arraylen: usize,
    iodesc: &IoDesc,
) -> FlushNeed {
    let stats = file.pool.stats();
    if stats.curalloc >= file.buffer_size_limit {
        return FlushNeed::Disk;
    }

    let decomp_max_regions = iodesc.maxregions.max(iodesc.maxfillregions);
    let io_max_regions = (1 + wmb.num_arrays) * decomp_max_regions;
    if io_max_regions > config::max_cached_io_regions() {
        return FlushNeed::Disk;
    }

    let array_sz_bytes = arraylen * iodesc.mpitype_size;
    let wmb_req_cache_sz = (1 + wmb.num_arrays) * array_sz_bytes;
    if (stats.maxfree as f64) <= 1.1 * wmb_req_cache_sz as f64 {
        return FlushNeed::Io;
    }

    FlushNeed::No
}

/// Drain one write-multi-buffer through the multi-variable write path.
///
/// On success the entry's queued payloads are released and its counter
/// resets to zero; on failure the queued contents stay in place so the
/// caller can retry.
pub(crate) fn flush_buffer(
    ios: &mut IoSystem,
    file: &mut File,
    idx: usize,
    wait_for_disk: bool,
) -> Result<()> {
    if file.buffer[idx].is_empty() {
        return Ok(());
    }
    // Detach the entry so the orchestrator can borrow the file.
    let ioid = file.buffer[idx].ioid;
    let recordvar = file.buffer[idx].recordvar;
    let wmb = std::mem::replace(&mut file.buffer[idx], WriteMultiBuffer::new(ioid, recordvar));

    tracing::debug!(
        ncid = file.ncid,
        ioid,
        num_arrays = wmb.num_arrays,
        wait_for_disk,
        "flushing write cache"
    );

    let data = wmb.data.as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
    let fills = wmb.fillvalue.as_ref().map(|b| b.as_slice());
    let frames = wmb.frame.as_deref();
    let res = crate::darray::write_darray_multi(
        ios,
        file,
        &wmb.vid,
        ioid,
        wmb.arraylen,
        data,
        frames,
        fills,
        wait_for_disk,
    );

    let mut wmb = wmb;
    match res {
        Ok(()) => {
            wmb.reset();
            file.buffer[idx] = wmb;
            Ok(())
        }
        Err(e) => {
            file.buffer[idx] = wmb;
            Err(e)
        }
    }
}

/// Complete deferred backend writes and release the I/O-side scratch
/// the nonblocking parallel backend has been holding.
///
/// With `wait_for_disk` false this is a no-op: the backend keeps
/// buffering and the staged blocks stay under its ownership.
pub(crate) fn flush_output_buffer(
    ios: &mut IoSystem,
    file: &mut File,
    wait_for_disk: bool,
) -> Result<()> {
    debug_assert_eq!(file.iotype, IoType::ParallelV3);
    if !wait_for_disk {
        return Ok(());
    }
    file.backend.flush_output_buffer(ios, true)?;
    file.iobuf = None;
    for v in &mut file.varlist {
        v.fillbuf = None;
        v.wb_pend = 0;
    }
    file.wb_pend = 0;
    Ok(())
}
