//! Moving payload between compute-side and I/O-side layouts.
//!
//! Both directions reduce to one invocation of the exchange engine over
//! the union communicator, with per-peer counts and displacements
//! derived from the decomposition. Payload is staged through packed
//! per-peer blocks: within each peer block the layout is variable-major
//! and, within a variable, ordered by destination slot, so sender and
//! receiver agree without carrying indices on the wire.

use crate::comm::{swapm, ExchangePlan, SwapmOpts};
use crate::decomp::IoDesc;
use crate::error::Result;
use crate::iosystem::IoSystem;

/// Rearrange payload from compute layout to I/O layout.
///
/// `src` holds `nvars` local tiles back to back (each tile stride is
/// derived from the buffer length; only the first `ndof` elements of a
/// tile travel). `dst` is the I/O-side scratch buffer, variable-major
/// with stride `llen` elements; on tasks with no I/O role it stays
/// untouched. With `needsfill` on a `Box` decomposition the caller
/// pre-fills `dst` before rearranging.
pub fn rearrange_comp2io(
    ios: &mut IoSystem,
    iodesc: &IoDesc,
    src: &[u8],
    dst: &mut [u8],
    nvars: usize,
) -> Result<()> {
    let esz = iodesc.mpitype_size;
    let nprocs = ios.union_comm.size();
    let stride = if nvars > 0 && esz > 0 {
        src.len() / nvars / esz
    } else {
        0
    };
    debug_assert!(stride >= iodesc.ndof || iodesc.ndof == 0);

    // Pack: per destination I/O task, variable-major, slot-ordered.
    let mut sendlens = vec![0usize; nprocs];
    let mut sdispls = vec![0usize; nprocs];
    let send_total: usize = iodesc.scount.iter().sum::<usize>() * nvars * esz;
    let mut sendbuf = Vec::with_capacity(send_total);
    let mut base = 0usize;
    for (t, &cnt) in iodesc.scount.iter().enumerate() {
        let peer = ios.io_union_rank(t);
        sdispls[peer] = sendbuf.len();
        sendlens[peer] = cnt * nvars * esz;
        for v in 0..nvars {
            for &local in &iodesc.sindex[base..base + cnt] {
                let off = (v * stride + local) * esz;
                sendbuf.extend_from_slice(&src[off..off + esz]);
            }
        }
        base += cnt;
    }

    // Receive side: one contiguous block per compute peer, scattered
    // into the scratch buffer afterwards.
    let mut recvlens = vec![0usize; nprocs];
    let mut rdispls = vec![0usize; nprocs];
    let mut off = 0usize;
    for (c, &cnt) in iodesc.rcount.iter().enumerate() {
        let peer = ios.comp_union_rank(c);
        rdispls[peer] = off;
        recvlens[peer] = cnt * nvars * esz;
        off += recvlens[peer];
    }
    let mut recvbuf = vec![0u8; off];

    let opts = SwapmOpts {
        handshake: ios.rearr_opts.handshake,
        isend: ios.rearr_opts.isend,
        max_requests: ios.rearr_opts.max_requests,
    };
    swapm(
        &mut ios.union_comm,
        ExchangePlan {
            sendbuf: &sendbuf,
            sendlens: &sendlens,
            sdispls: &sdispls,
            recvbuf: &mut recvbuf,
            recvlens: &recvlens,
            rdispls: &rdispls,
        },
        opts,
    )?;

    // Scatter into the I/O buffer, variable-major with stride llen.
    let llen = iodesc.llen;
    let mut rbase = 0usize;
    let mut roff = 0usize;
    for &cnt in iodesc.rcount.iter() {
        for v in 0..nvars {
            for &slot in &iodesc.rindex[rbase..rbase + cnt] {
                let doff = (v * llen + slot) * esz;
                dst[doff..doff + esz].copy_from_slice(&recvbuf[roff..roff + esz]);
                roff += esz;
            }
        }
        rbase += cnt;
    }

    tracing::trace!(
        nvars,
        sent = sendbuf.len(),
        received = recvbuf.len(),
        "rearranged compute to io"
    );
    Ok(())
}

/// Rearrange one variable's payload from I/O layout back to compute
/// layout; the read-path inverse of [`rearrange_comp2io`].
pub fn rearrange_io2comp(
    ios: &mut IoSystem,
    iodesc: &IoDesc,
    src: &[u8],
    dst: &mut [u8],
) -> Result<()> {
    let esz = iodesc.mpitype_size;
    let nprocs = ios.union_comm.size();

    // I/O side packs per compute peer, in the same slot order the
    // write path used.
    let mut sendlens = vec![0usize; nprocs];
    let mut sdispls = vec![0usize; nprocs];
    let send_total: usize = iodesc.rcount.iter().sum::<usize>() * esz;
    let mut sendbuf = Vec::with_capacity(send_total);
    let mut rbase = 0usize;
    for (c, &cnt) in iodesc.rcount.iter().enumerate() {
        let peer = ios.comp_union_rank(c);
        sdispls[peer] = sendbuf.len();
        sendlens[peer] = cnt * esz;
        for &slot in &iodesc.rindex[rbase..rbase + cnt] {
            let off = slot * esz;
            sendbuf.extend_from_slice(&src[off..off + esz]);
        }
        rbase += cnt;
    }

    let mut recvlens = vec![0usize; nprocs];
    let mut rdispls = vec![0usize; nprocs];
    let mut off = 0usize;
    for (t, &cnt) in iodesc.scount.iter().enumerate() {
        let peer = ios.io_union_rank(t);
        rdispls[peer] = off;
        recvlens[peer] = cnt * esz;
        off += recvlens[peer];
    }
    let mut recvbuf = vec![0u8; off];

    let opts = SwapmOpts {
        handshake: ios.rearr_opts.handshake,
        isend: ios.rearr_opts.isend,
        max_requests: ios.rearr_opts.max_requests,
    };
    swapm(
        &mut ios.union_comm,
        ExchangePlan {
            sendbuf: &sendbuf,
            sendlens: &sendlens,
            sdispls: &sdispls,
            recvbuf: &mut recvbuf,
            recvlens: &recvlens,
            rdispls: &rdispls,
        },
        opts,
    )?;

    // Scatter received elements back to this task's tile order.
    let mut roff = 0usize;
    let mut sbase = 0usize;
    for &cnt in iodesc.scount.iter() {
        for &local in &iodesc.sindex[sbase..sbase + cnt] {
            let doff = local * esz;
            dst[doff..doff + esz].copy_from_slice(&recvbuf[roff..roff + esz]);
            roff += esz;
        }
        sbase += cnt;
    }

    Ok(())
}
