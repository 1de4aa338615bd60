//! Distributed-array write and read entry points.
//!
//! Writes aggregate on compute tasks and only travel to the I/O tasks
//! when the cache drains: a user call appends to the file's
//! write-multi-buffer, the flush controller decides (collectively)
//! whether to drain, and the multi-variable orchestrator rearranges,
//! dispatches to the backend, and runs the hole-fill pass for sparse
//! decompositions. Reads are symmetric but simpler: no aggregation.

use crate::backend::{IoType, WriteCtx, WriteMode};
use crate::decomp::{IoDesc, Rearranger};
use crate::dispatch;
use crate::error::{report, Error, Result};
use crate::file::{File, MAX_VARS};
use crate::flush::{self, FlushNeed};
use crate::iosystem::IoSystem;
use crate::memory::PoolBlock;
use crate::rearrange::{rearrange_comp2io, rearrange_io2comp};

pub use crate::config::set_buffer_size_limit;

/// Write one distributed array, buffering it on the compute side.
///
/// The payload is queued in the file's write-multi-buffer for
/// `(ioid, recordvar)`; actual I/O happens when the flush controller
/// drains the buffer. `arraylen` must be at least the decomposition's
/// local size; values past it are ignored. For record variables the
/// current frame must have been set.
///
/// Collective over the compute communicator: all compute tasks must
/// call in the same order with matching arguments.
pub fn write_darray(
    ios: &mut IoSystem,
    file: &mut File,
    varid: i32,
    ioid: i32,
    arraylen: usize,
    array: &[u8],
    fillvalue: Option<&[u8]>,
) -> Result<()> {
    if !file.writable() {
        return Err(report(Error::Permission));
    }
    let iodesc = ios.decomp(ioid)?;
    if arraylen < iodesc.ndof {
        return Err(report(Error::Invalid(format!(
            "arraylen {} shorter than local decomposition size {}",
            arraylen, iodesc.ndof
        ))));
    }
    if arraylen > iodesc.ndof {
        tracing::warn!(
            arraylen,
            ndof = iodesc.ndof,
            "arraylen exceeds local decomposition size; excess ignored"
        );
    }
    let arraylen = iodesc.ndof;
    let esz = iodesc.mpitype_size;
    if array.len() < arraylen * esz {
        return Err(report(Error::Invalid(format!(
            "payload holds {} bytes, decomposition needs {}",
            array.len(),
            arraylen * esz
        ))));
    }

    // Resolve the fill value up front: the user's, else the variable's
    // cached one, defaulted from the element type on first need.
    let (recordvar, frame, fill, vrsize) = {
        let async_io = ios.is_async() && ios.ioproc();
        let vdesc = file.var_mut(varid)?;
        let fill = if iodesc.needsfill {
            match fillvalue {
                Some(f) if f.len() < esz => {
                    return Err(report(Error::Invalid(format!(
                        "fill value holds {} bytes, element size is {esz}",
                        f.len()
                    ))))
                }
                Some(f) => Some(f[..esz].to_vec()),
                None => Some(vdesc.find_fillvalue()?.to_vec()),
            }
        } else {
            None
        };
        if vdesc.vrsize == 0 && !async_io {
            vdesc.vrsize = (iodesc.gsize * iodesc.piotype_size) as u64;
        }
        let recordvar = vdesc.record >= 0;
        let frame = recordvar.then_some(vdesc.record);
        (recordvar, frame, fill, vdesc.vrsize)
    };

    let idx = file.wmb_index(ioid, recordvar);

    // Local decision, then collective agreement: every compute task
    // must flush together or the rearrangement deadlocks.
    let local = flush::needs_flush(file, &file.buffer[idx], arraylen, &iodesc);
    let agreed = FlushNeed::from_i32(ios.comp().allreduce_max(local as i32)?);
    tracing::debug!(ncid = file.ncid, varid, ?local, ?agreed, "flush decision");

    if agreed > FlushNeed::No {
        file.pool.usage_report();
        flush::flush_buffer(ios, file, idx, agreed == FlushNeed::Disk)?;
    }

    // One record's worth (summed across tasks) is now buffered.
    file.var_mut(varid)?.wb_pend += vrsize;
    file.wb_pend += vrsize;

    let pool = file.pool.clone();
    file.buffer[idx].append(
        &pool,
        esz,
        arraylen,
        varid,
        &array[..arraylen * esz],
        fill.as_deref(),
        frame,
    )
}

/// Write one or more arrays sharing a decomposition, bypassing the
/// compute-side cache.
///
/// `arrays` holds `nvars` payloads back to back. `frames` gives the
/// record index per variable (`None` for non-record variables);
/// `fillvalues` gives one element-sized fill per variable. With
/// `flushtodisk` the write is pushed all the way to disk.
#[allow(clippy::too_many_arguments)]
pub fn write_darray_multi(
    ios: &mut IoSystem,
    file: &mut File,
    varids: &[i32],
    ioid: i32,
    arraylen: usize,
    arrays: &[u8],
    frames: Option<&[i32]>,
    fillvalues: Option<&[u8]>,
    flushtodisk: bool,
) -> Result<()> {
    if varids.is_empty() {
        return Err(report(Error::Invalid("no variables to write".into())));
    }
    for &v in varids {
        if !(0..=MAX_VARS).contains(&v) {
            return Err(report(Error::Invalid(format!("variable id {v} out of range"))));
        }
    }
    if !file.writable() {
        return Err(report(Error::Permission));
    }
    let iodesc = ios.decomp(ioid)?;
    if let Some(f) = frames {
        if f.len() != varids.len() {
            return Err(report(Error::Invalid("one frame per variable required".into())));
        }
    }
    if let Some(fv) = fillvalues {
        if fv.len() < varids.len() * iodesc.mpitype_size {
            return Err(report(Error::Invalid("one fill value per variable required".into())));
        }
    }

    // Number of file dims comes from the compute side; under async the
    // I/O side learns it through the broadcast below.
    let mut fndims = 0usize;
    if !ios.is_async() || !ios.ioproc() {
        fndims = file.var(varids[0])?.ndims;
    }

    if ios.is_async() && !ios.ioproc() {
        fndims = dispatch::bcast_write_darray_multi(
            ios,
            file.ncid,
            varids,
            ioid,
            arraylen,
            arrays,
            frames,
            fillvalues,
            flushtodisk,
            fndims,
            &iodesc,
        )?;
    }

    write_darray_multi_impl(
        ios, file, varids, &iodesc, arrays, frames, fillvalues, flushtodisk, fndims,
    )
}

/// The multi-variable write coordinator, shared by the direct path and
/// the async message path.
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_darray_multi_impl(
    ios: &mut IoSystem,
    file: &mut File,
    varids: &[i32],
    iodesc: &IoDesc,
    arrays: &[u8],
    frames: Option<&[i32]>,
    fillvalues: Option<&[u8]>,
    flushtodisk: bool,
    fndims: usize,
) -> Result<()> {
    let nvars = varids.len();
    let esz = iodesc.mpitype_size;

    // The nonblocking parallel backend may still own a scratch buffer
    // from a previous buffered write; complete it first.
    if file.iotype == IoType::ParallelV3 && file.iobuf.is_some() {
        flush::flush_output_buffer(ios, file, true)?;
    }
    assert!(file.iobuf.is_none(), "scratch buffer overwrite");

    // Stage the I/O-side buffer. The serial backends funnel every
    // task's payload through the I/O master, so sizing uses the global
    // maximum rather than the local region length.
    let rlen = nvars * iodesc.maxiobuflen;
    let mut iobuf: Option<PoolBlock> = None;
    if rlen > 0 {
        let mut block = file.pool.acquire(rlen * esz)?;
        if iodesc.needsfill && iodesc.rearranger == Rearranger::Box {
            // Box covers every slot once fill is pre-inserted; slots a
            // compute task contributes are overwritten next.
            if let Some(fills) = fillvalues {
                let buf = block.as_mut_slice();
                for v in 0..nvars {
                    let fill = &fills[v * esz..(v + 1) * esz];
                    for i in 0..iodesc.llen {
                        buf[(v * iodesc.llen + i) * esz..(v * iodesc.llen + i + 1) * esz]
                            .copy_from_slice(fill);
                    }
                }
            }
        }
        iobuf = Some(block);
    } else if file.iotype == IoType::ParallelV3 && ios.ioproc() {
        // Zero-length token so the pre-flush above stays collective
        // across all I/O tasks on the next write.
        iobuf = Some(file.pool.acquire(1)?);
    }

    {
        let dst: &mut [u8] = match iobuf.as_mut() {
            Some(b) => b.as_mut_slice(),
            None => &mut [],
        };
        rearrange_comp2io(ios, iodesc, arrays, dst, nvars)?;
    }

    let buf_slice: &[u8] = iobuf.as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
    let ctx = WriteCtx {
        nvars,
        fndims,
        varids,
        frames,
        iodesc,
        buf: buf_slice,
    };
    match file.iotype {
        IoType::ParallelV3 | IoType::ParallelV4 => {
            file.backend.write_darray_multi_par(ios, ctx, WriteMode::Data)?
        }
        IoType::SerialV3 | IoType::SerialV4 => {
            file.backend.write_darray_multi_serial(ios, ctx, WriteMode::Data)?
        }
    }

    // The nonblocking parallel backend owns the scratch until its
    // flush; everyone else releases at the call boundary.
    if file.iotype == IoType::ParallelV3 {
        file.iobuf = iobuf.take();
    }
    drop(iobuf);

    // Sparse decompositions leave holes no compute task wrote; a
    // second pass materializes fill values there.
    if iodesc.rearranger == Rearranger::Subset && iodesc.needsfill {
        assert!(
            file.var(varids[0])?.fillbuf.is_none(),
            "fill buffer overwrite"
        );
        let fbsize = if ios.iomaster() {
            iodesc.maxholegridsize
        } else if ios.ioproc() {
            iodesc.holegridsize
        } else {
            0
        };
        let mut fillbuf: Option<PoolBlock> = None;
        if fbsize > 0 {
            let mut block = file.pool.acquire(fbsize * nvars * esz)?;
            if let Some(fills) = fillvalues {
                let buf = block.as_mut_slice();
                let stride = iodesc.holegridsize;
                for v in 0..nvars {
                    let fill = &fills[v * esz..(v + 1) * esz];
                    for i in 0..stride {
                        buf[(v * stride + i) * esz..(v * stride + i + 1) * esz]
                            .copy_from_slice(fill);
                    }
                }
            }
            fillbuf = Some(block);
        }

        let fill_slice: &[u8] = fillbuf.as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
        let ctx = WriteCtx {
            nvars,
            fndims,
            varids,
            frames,
            iodesc,
            buf: fill_slice,
        };
        match file.iotype {
            IoType::ParallelV3 | IoType::ParallelV4 => {
                file.backend.write_darray_multi_par(ios, ctx, WriteMode::Fill)?
            }
            IoType::SerialV3 | IoType::SerialV4 => {
                file.backend.write_darray_multi_serial(ios, ctx, WriteMode::Fill)?
            }
        }

        if file.iotype == IoType::ParallelV3 {
            file.var_mut(varids[0])?.fillbuf = fillbuf.take();
        }
        drop(fillbuf);
    }

    if ios.ioproc() && file.iotype == IoType::ParallelV3 {
        // Only the nonblocking parallel backend needs the explicit
        // flush to push buffered data to disk.
        flush::flush_output_buffer(ios, file, flushtodisk)?;
    } else {
        for &v in varids {
            file.var_mut(v)?.wb_pend = 0;
        }
        file.wb_pend = 0;
    }

    Ok(())
}

/// Read one distributed array.
///
/// `arraylen` must be at least the decomposition's local size. The
/// I/O tasks read their regions through the backend and the result is
/// rearranged back into each compute task's tile.
pub fn read_darray(
    ios: &mut IoSystem,
    file: &mut File,
    varid: i32,
    ioid: i32,
    arraylen: usize,
    array: &mut [u8],
) -> Result<()> {
    let iodesc = ios.decomp(ioid)?;
    if arraylen < iodesc.ndof {
        return Err(report(Error::Invalid(format!(
            "arraylen {} shorter than local decomposition size {}",
            arraylen, iodesc.ndof
        ))));
    }
    let esz = iodesc.mpitype_size;

    // The master's buffer is sized to the global maximum: the serial
    // backends stage every task's regions through it.
    let rlen = if ios.iomaster() {
        iodesc.maxiobuflen
    } else {
        iodesc.llen
    };

    let (frame, vrsize) = {
        let async_io = ios.is_async() && ios.ioproc();
        let vdesc = file.var_mut(varid)?;
        if vdesc.vrsize == 0 && !async_io {
            vdesc.vrsize = (iodesc.gsize * iodesc.piotype_size) as u64;
        }
        (vdesc.record, vdesc.vrsize)
    };
    file.var_mut(varid)?.rb_pend += vrsize;
    file.rb_pend += vrsize;

    let mut iobuf: Option<PoolBlock> = None;
    if ios.ioproc() && rlen > 0 {
        iobuf = Some(file.pool.acquire(rlen * esz)?);
    }

    {
        let dst: &mut [u8] = match iobuf.as_mut() {
            Some(b) => b.as_mut_slice(),
            None => &mut [],
        };
        match file.iotype {
            IoType::SerialV3 | IoType::SerialV4 => {
                file.backend.read_darray_serial(ios, varid, frame, &iodesc, dst)?
            }
            IoType::ParallelV3 | IoType::ParallelV4 => {
                file.backend.read_darray_par(ios, varid, frame, &iodesc, dst)?
            }
        }
    }

    let src: &[u8] = iobuf.as_ref().map(|b| b.as_slice()).unwrap_or(&[]);
    rearrange_io2comp(ios, &iodesc, src, &mut array[..iodesc.ndof * esz])?;

    // Reads are not buffered.
    file.var_mut(varid)?.rb_pend = 0;
    file.rb_pend = 0;

    Ok(())
}
