//! Async dispatch: shipping write calls from compute to I/O tasks.
//!
//! When compute and I/O tasks are disjoint groups, a compute-side
//! write call is packaged as a message: the compute master notifies
//! the I/O master with an operation tag, then broadcasts the call
//! parameters to the whole I/O group. The broadcast order is fixed and
//! is part of the wire contract:
//!
//! `ncid, nvars, varids[nvars], ioid, arraylen, payload,
//! frame_present, frame[nvars]?, fillvalue_present, fillvalue bytes?,
//! flushtodisk`
//!
//! The I/O-side message loop itself lives outside the library; on
//! receiving the write tag it re-enters the orchestrator through
//! [`recv_write_darray_multi`].

use crate::decomp::IoDesc;
use crate::error::{report, Error, Result};
use crate::file::File;
use crate::iosystem::IoSystem;
use bytes::{Buf, BufMut, Bytes};

/// Tag for the operation-announcement message to the I/O master.
const MSG_TAG: u64 = 1;
/// Tag for compute-master to I/O-group parameter traffic. Delivery is
/// FIFO per sender and tag, so one tag carries the whole fixed-order
/// parameter sequence.
const PARAM_TAG: u64 = 1 << 33;

/// Operations the I/O side can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    /// Multi-variable distributed-array write.
    WriteDarrayMulti = 0x10,
}

impl Msg {
    /// Decode an operation tag.
    pub fn from_tag(tag: i32) -> Result<Msg> {
        match tag {
            0x10 => Ok(Msg::WriteDarrayMulti),
            other => Err(report(Error::Invalid(format!("unknown message tag {other}")))),
        }
    }
}

fn send_to_io_group(ios: &mut IoSystem, payload: Bytes) -> Result<()> {
    for t in 0..ios.num_iotasks() {
        let peer = ios.io_union_rank(t);
        ios.union_comm.send(peer, PARAM_TAG, payload.clone())?;
    }
    Ok(())
}

fn i32_bytes(v: i32) -> Bytes {
    Bytes::copy_from_slice(&v.to_le_bytes())
}

/// Compute side of the async write dispatch.
///
/// The compute master sends the operation tag and the parameter
/// sequence; every compute task then joins the union-wide error
/// agreement and the `fndims` share. Returns the agreed `fndims`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn bcast_write_darray_multi(
    ios: &mut IoSystem,
    ncid: i32,
    varids: &[i32],
    ioid: i32,
    arraylen: usize,
    arrays: &[u8],
    frames: Option<&[i32]>,
    fillvalues: Option<&[u8]>,
    flushtodisk: bool,
    fndims: usize,
    iodesc: &IoDesc,
) -> Result<usize> {
    debug_assert!(ios.is_async() && !ios.ioproc());
    let nvars = varids.len();
    let esz = iodesc.piotype_size;

    let mut local_err: i32 = 0;
    if ios.compmaster() {
        let ioroot = ios.ioroot_union();
        let sent = (|| -> Result<()> {
            ios.union_comm
                .send(ioroot, MSG_TAG, i32_bytes(Msg::WriteDarrayMulti as i32))?;

            send_to_io_group(ios, i32_bytes(ncid))?;
            send_to_io_group(ios, i32_bytes(nvars as i32))?;
            let mut vb = Vec::with_capacity(nvars * 4);
            for &v in varids {
                vb.put_i32_le(v);
            }
            send_to_io_group(ios, Bytes::from(vb))?;
            send_to_io_group(ios, i32_bytes(ioid))?;
            let mut ab = Vec::with_capacity(8);
            ab.put_u64_le(arraylen as u64);
            send_to_io_group(ios, Bytes::from(ab))?;
            let pl_len = (arraylen * esz).min(arrays.len());
            send_to_io_group(ios, Bytes::copy_from_slice(&arrays[..pl_len]))?;

            send_to_io_group(ios, Bytes::from(vec![u8::from(frames.is_some())]))?;
            if let Some(frames) = frames {
                let mut fb = Vec::with_capacity(nvars * 4);
                for &f in frames {
                    fb.put_i32_le(f);
                }
                send_to_io_group(ios, Bytes::from(fb))?;
            }
            send_to_io_group(ios, Bytes::from(vec![u8::from(fillvalues.is_some())]))?;
            if let Some(fv) = fillvalues {
                send_to_io_group(ios, Bytes::copy_from_slice(&fv[..nvars * esz]))?;
            }
            send_to_io_group(ios, i32_bytes(i32::from(flushtodisk)))?;
            Ok(())
        })();
        if sent.is_err() {
            local_err = 1;
        }
    }

    // Everyone learns whether the parameter phase failed anywhere.
    let comproot = ios.comproot_union();
    let code = ios.union_comm.bcast_i32(comproot, local_err)?;
    if code != 0 {
        return Err(report(Error::Comm {
            peer: comproot,
            tag: PARAM_TAG,
            reason: "async write dispatch failed".into(),
        }));
    }

    // Share what only the computation side knows.
    let fndims = ios.union_comm.bcast_i32(comproot, fndims as i32)? as usize;
    tracing::debug!(ncid, nvars, ioid, arraylen, fndims, "dispatched write to io tasks");
    Ok(fndims)
}

/// Receive the next operation tag on the I/O side.
///
/// The I/O master takes the announcement from the compute master and
/// shares it across the I/O communicator.
pub fn recv_msg(ios: &mut IoSystem) -> Result<Msg> {
    debug_assert!(ios.is_async() && ios.ioproc());
    let tag = if ios.iomaster() {
        let b = ios.union_comm.recv(ios.comproot_union(), MSG_TAG)?;
        i32::from_le_bytes(b[..4].try_into().map_err(|_| {
            report(Error::Comm {
                peer: 0,
                tag: MSG_TAG,
                reason: "malformed operation tag".into(),
            })
        })?)
    } else {
        0
    };
    let tag = ios.io().bcast_i32(0, tag)?;
    Msg::from_tag(tag)
}

/// I/O side of the async write dispatch: decode the parameter sequence
/// and re-enter the orchestrator against the named file.
pub fn recv_write_darray_multi(ios: &mut IoSystem, files: &mut [File]) -> Result<()> {
    debug_assert!(ios.is_async() && ios.ioproc());
    let root = ios.comproot_union();

    let recv_i32 = |ios: &mut IoSystem| -> Result<i32> {
        let b = ios.union_comm.recv(root, PARAM_TAG)?;
        Ok(i32::from_le_bytes(b[..4].try_into().expect("i32 parameter")))
    };

    let ncid = recv_i32(ios)?;
    let nvars = recv_i32(ios)? as usize;
    let mut vb = ios.union_comm.recv(root, PARAM_TAG)?;
    let mut varids = Vec::with_capacity(nvars);
    for _ in 0..nvars {
        varids.push(vb.get_i32_le());
    }
    let ioid = recv_i32(ios)?;
    let mut ab = ios.union_comm.recv(root, PARAM_TAG)?;
    let arraylen = ab.get_u64_le() as usize;
    let payload = ios.union_comm.recv(root, PARAM_TAG)?;

    let frame_present = ios.union_comm.recv(root, PARAM_TAG)?[0] != 0;
    let frames: Option<Vec<i32>> = if frame_present {
        let mut fb = ios.union_comm.recv(root, PARAM_TAG)?;
        Some((0..nvars).map(|_| fb.get_i32_le()).collect())
    } else {
        None
    };
    let fillvalue_present = ios.union_comm.recv(root, PARAM_TAG)?[0] != 0;
    let fillvalues: Option<Bytes> = if fillvalue_present {
        Some(ios.union_comm.recv(root, PARAM_TAG)?)
    } else {
        None
    };
    let flushtodisk = recv_i32(ios)? != 0;

    // Join the union-wide error agreement and fndims share.
    let code = ios.union_comm.bcast_i32(root, 0)?;
    if code != 0 {
        return Err(report(Error::Comm {
            peer: root,
            tag: PARAM_TAG,
            reason: "async write dispatch failed".into(),
        }));
    }
    let fndims = ios.union_comm.bcast_i32(root, 0)? as usize;

    let iodesc = ios.decomp(ioid)?;
    let file = files
        .iter_mut()
        .find(|f| f.ncid == ncid)
        .ok_or_else(|| report(Error::BadId { kind: "file", id: ncid }))?;

    tracing::debug!(ncid, nvars, ioid, arraylen, fndims, "entering write from message loop");
    crate::darray::write_darray_multi_impl(
        ios,
        file,
        &varids,
        &iodesc,
        &payload,
        frames.as_deref(),
        fillvalues.as_deref(),
        flushtodisk,
        fndims,
    )
}
