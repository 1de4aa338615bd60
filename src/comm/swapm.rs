//! Variable-size all-to-all exchange with windowed flow control.
//!
//! The pair schedule is an edge-coloring of the hypercube: at step `k`
//! every rank talks to `(k + 1) XOR rank`, so each step pairs the whole
//! world off without conflicts. Combined with the handshake ready-send
//! pattern, ad-hoc schedule replacements risk deadlock; keep it.

use super::fabric::{Comm, RecvHandle};
use crate::config::MAX_GATHER_BLOCK_SIZE;
use crate::error::{report, Error, Result};
use bytes::Bytes;
use smallvec::SmallVec;

/// Tuning options for one exchange. The default is a plain exchange:
/// no handshake, blocking sends, unbounded outstanding receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwapmOpts {
    /// Receiver pre-announces readiness; the sender issues its data
    /// send only after the announcement arrives.
    pub handshake: bool,
    /// Use non-blocking sends.
    pub isend: bool,
    /// Maximum simultaneously outstanding receives; 0 means unbounded.
    pub max_requests: usize,
}

/// Per-peer send/receive layout for one exchange, all in bytes.
///
/// `sendlens[p]` bytes starting at `sdispls[p]` of `sendbuf` go to peer
/// `p`; `recvlens[p]` bytes from peer `p` land at `rdispls[p]` of
/// `recvbuf`.
pub struct ExchangePlan<'a> {
    /// Outgoing payload staging buffer.
    pub sendbuf: &'a [u8],
    /// Bytes to send to each peer.
    pub sendlens: &'a [usize],
    /// Byte offset of each peer's slice in `sendbuf`.
    pub sdispls: &'a [usize],
    /// Incoming payload destination buffer.
    pub recvbuf: &'a mut [u8],
    /// Bytes expected from each peer.
    pub recvlens: &'a [usize],
    /// Byte offset of each peer's slice in `recvbuf`.
    pub rdispls: &'a [usize],
}

/// Smallest power of two that is at least `i`.
pub fn ceil2(i: usize) -> usize {
    let mut p = 1;
    while p < i {
        p *= 2;
    }
    p
}

/// Partner of rank `me` at schedule step `istep` in a world of `np`,
/// or `None` when the XOR lands outside the world.
pub fn pair(np: usize, istep: usize, me: usize) -> Option<usize> {
    let q = (istep + 1) ^ me;
    (q <= np - 1).then_some(q)
}

static HS_PAYLOAD: [u8; 4] = 1i32.to_ne_bytes();

/// The one-element readiness announcement.
fn hs() -> Bytes {
    Bytes::from_static(&HS_PAYLOAD)
}

/// Exchange variable-size payloads with every peer.
///
/// Tag discipline within one invocation: data carries
/// `sender + nprocs`, the handshake carries `receiver + nprocs`, so
/// concurrent windows cannot cross-deliver. Every posted receive is
/// drained before returning.
pub fn swapm(comm: &mut Comm, plan: ExchangePlan<'_>, opts: SwapmOpts) -> Result<()> {
    let nprocs = comm.size();
    let me = comm.rank();
    let offset_t = nprocs as u64;
    debug_assert_eq!(plan.sendlens.len(), nprocs);
    debug_assert_eq!(plan.recvlens.len(), nprocs);

    let ExchangePlan {
        sendbuf,
        sendlens,
        sdispls,
        recvbuf,
        recvlens,
        rdispls,
    } = plan;

    let place = |recvbuf: &mut [u8], p: usize, data: &Bytes| -> Result<()> {
        if data.len() != recvlens[p] {
            return Err(report(Error::Comm {
                peer: p,
                tag: p as u64 + offset_t,
                reason: format!("expected {} bytes, got {}", recvlens[p], data.len()),
            }));
        }
        recvbuf[rdispls[p]..rdispls[p] + recvlens[p]].copy_from_slice(data);
        Ok(())
    };

    // Send to self.
    if sendlens[me] > 0 {
        let tag = me as u64 + offset_t;
        let h = comm.irecv(me, tag);
        let payload = Bytes::copy_from_slice(&sendbuf[sdispls[me]..sdispls[me] + sendlens[me]]);
        comm.send(me, tag, payload)?;
        let data = comm.wait(h)?;
        place(recvbuf, me, &data)?;
    }

    // Schedule: peers with traffic in either direction, hypercube order.
    let mut swapids: SmallVec<[usize; 16]> = SmallVec::new();
    for istep in 0..ceil2(nprocs).saturating_sub(1) {
        if let Some(p) = pair(nprocs, istep, me) {
            if sendlens[p] > 0 || recvlens[p] > 0 {
                swapids.push(p);
            }
        }
    }
    let steps = swapids.len();
    if steps == 0 {
        return Ok(());
    }

    let (maxreq, maxreqh) = if steps == 1 {
        (1, 1)
    } else if opts.max_requests == 0 {
        (steps, steps)
    } else if opts.max_requests == 1 {
        (2, 1)
    } else if opts.max_requests < steps {
        (opts.max_requests, opts.max_requests / 2)
    } else {
        (steps, steps / 2)
    };

    let mut hs_rcvids: Vec<Option<RecvHandle>> = vec![None; steps];
    let mut rcvids: Vec<Option<RecvHandle>> = vec![None; steps];

    // Prime the window: handshake expectations first, then receives
    // (announcing readiness to each sender as the receive is posted).
    if opts.handshake {
        for (istep, &p) in swapids.iter().take(maxreq).enumerate() {
            if sendlens[p] > 0 {
                hs_rcvids[istep] = Some(comm.irecv(p, me as u64 + offset_t));
            }
        }
    }
    for (istep, &p) in swapids.iter().take(maxreq).enumerate() {
        if recvlens[p] > 0 {
            rcvids[istep] = Some(comm.irecv(p, p as u64 + offset_t));
            if opts.handshake {
                comm.send(p, p as u64 + offset_t, hs())?;
            }
        }
    }

    let mut rstep = maxreq;
    for istep in 0..steps {
        let p = swapids[istep];
        if sendlens[p] > 0 {
            let tag = me as u64 + offset_t;
            if opts.handshake {
                if let Some(h) = hs_rcvids[istep].take() {
                    comm.wait(h)?;
                }
            }
            let payload = Bytes::copy_from_slice(&sendbuf[sdispls[p]..sdispls[p] + sendlens[p]]);
            if opts.isend {
                comm.isend(p, tag, payload)?;
            } else {
                comm.send(p, tag, payload)?;
            }
        }
        // Slide the window: drain the oldest receive, post the next.
        if istep >= maxreqh {
            let q = swapids[istep - maxreqh];
            if recvlens[q] > 0 {
                if let Some(h) = rcvids[istep - maxreqh].take() {
                    let data = comm.wait(h)?;
                    place(recvbuf, q, &data)?;
                }
            }
            if rstep < steps {
                let q = swapids[rstep];
                if opts.handshake && sendlens[q] > 0 {
                    hs_rcvids[rstep] = Some(comm.irecv(q, me as u64 + offset_t));
                }
                if recvlens[q] > 0 {
                    rcvids[rstep] = Some(comm.irecv(q, q as u64 + offset_t));
                    if opts.handshake {
                        comm.send(q, q as u64 + offset_t, hs())?;
                    }
                }
                rstep += 1;
            }
        }
    }

    // Trailing drain. Send handles complete on posting, so the isend
    // cleanup is the conservative wait-on-null.
    for istep in steps.saturating_sub(maxreqh)..steps {
        let p = swapids[istep];
        if recvlens[p] > 0 {
            if let Some(h) = rcvids[istep].take() {
                let data = comm.wait(h)?;
                place(recvbuf, p, &data)?;
            }
        }
    }
    debug_assert!(rcvids.iter().all(Option::is_none), "undrained receive");

    Ok(())
}

/// Gather equal-size blocks to `root` with optional flow control.
///
/// With `flow_cntl > 0` the root pre-announces readiness to at most
/// `min(flow_cntl, MAX_GATHER_BLOCK_SIZE)` senders at a time and each
/// sender ready-sends only after its announcement; with `flow_cntl <= 0`
/// this degrades to a plain gather. On the root, `recvbuf` must hold
/// `nprocs * blocklen` bytes and peer `p`'s block lands at offset
/// `p * blocklen`.
pub fn fc_gather(
    comm: &mut Comm,
    sendbuf: &[u8],
    recvbuf: Option<&mut [u8]>,
    blocklen: usize,
    root: usize,
    flow_cntl: i32,
) -> Result<()> {
    let nprocs = comm.size();
    let me = comm.rank();
    let mtag = 2 * nprocs as u64;

    if me == root {
        let recvbuf = recvbuf.ok_or_else(|| {
            report(Error::Invalid("gather root needs a receive buffer".into()))
        })?;
        if recvbuf.len() < nprocs * blocklen {
            return Err(report(Error::Invalid(format!(
                "gather receive buffer holds {} bytes, need {}",
                recvbuf.len(),
                nprocs * blocklen
            ))));
        }
        if blocklen > 0 {
            recvbuf[me * blocklen..(me + 1) * blocklen].copy_from_slice(&sendbuf[..blocklen]);
        }
        if blocklen == 0 {
            return Ok(());
        }

        if flow_cntl > 0 {
            let window = (flow_cntl as usize)
                .min(MAX_GATHER_BLOCK_SIZE)
                .min(nprocs.saturating_sub(1))
                .max(1);
            let mut outstanding: SmallVec<[(usize, RecvHandle); MAX_GATHER_BLOCK_SIZE]> =
                SmallVec::new();
            for p in (0..nprocs).filter(|&p| p != root) {
                if outstanding.len() == window {
                    let (q, h) = outstanding.remove(0);
                    let data = comm.wait(h)?;
                    recvbuf[q * blocklen..(q + 1) * blocklen].copy_from_slice(&data);
                }
                let h = comm.irecv(p, mtag);
                comm.send(p, mtag, hs())?;
                outstanding.push((p, h));
            }
            for (q, h) in outstanding {
                let data = comm.wait(h)?;
                recvbuf[q * blocklen..(q + 1) * blocklen].copy_from_slice(&data);
            }
        } else {
            for p in (0..nprocs).filter(|&p| p != root) {
                let data = comm.recv(p, mtag)?;
                recvbuf[p * blocklen..(p + 1) * blocklen].copy_from_slice(&data);
            }
        }
        Ok(())
    } else {
        if blocklen == 0 {
            return Ok(());
        }
        if flow_cntl > 0 {
            comm.recv(root, mtag)?;
        }
        comm.send(root, mtag, Bytes::copy_from_slice(&sendbuf[..blocklen]))
    }
}
