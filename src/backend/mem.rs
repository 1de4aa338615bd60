//! In-memory array store implementing the backend contract.
//!
//! Stands in for the real file-format adapters in tests and demos: one
//! record per `(varid, frame)` pair, written region-wise exactly the
//! way the contract hands regions over. The nonblocking parallel kind
//! queues its writes and applies them at flush time.

use super::{Backend, IoType, WriteCtx, WriteMode};
use crate::decomp::IoDesc;
use crate::error::{report, Error, Result};
use crate::iosystem::IoSystem;
use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Tag for the serial-funnel traffic on the I/O communicator.
const SERIAL_TAG: u64 = 1 << 20;

/// The shared record store: the "file" every I/O task writes into.
#[derive(Default)]
pub struct MemStore {
    records: Mutex<HashMap<(i32, i32), Vec<u8>>>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Arc<MemStore> {
        Arc::new(MemStore::default())
    }

    /// Copy of the record for `(varid, frame)`, if any. Non-record
    /// variables live at frame `-1`.
    pub fn snapshot(&self, varid: i32, frame: i32) -> Option<Vec<u8>> {
        self.records
            .lock()
            .expect("store lock poisoned")
            .get(&(varid, frame))
            .cloned()
    }

    fn write(&self, varid: i32, frame: i32, record_bytes: usize, off: usize, src: &[u8]) {
        let mut records = self.records.lock().expect("store lock poisoned");
        let rec = records
            .entry((varid, frame))
            .or_insert_with(|| vec![0u8; record_bytes]);
        rec[off..off + src.len()].copy_from_slice(src);
    }

    fn read(&self, varid: i32, frame: i32, off: usize, dst: &mut [u8]) -> Result<()> {
        let records = self.records.lock().expect("store lock poisoned");
        let rec = records.get(&(varid, frame)).ok_or_else(|| {
            report(Error::Backend(format!(
                "no record for variable {varid} frame {frame}"
            )))
        })?;
        dst.copy_from_slice(&rec[off..off + dst.len()]);
        Ok(())
    }
}

/// A deferred region write.
struct PendingWrite {
    varid: i32,
    frame: i32,
    record_bytes: usize,
    off: usize,
    data: Vec<u8>,
}

/// In-memory backend over a shared [`MemStore`].
pub struct MemBackend {
    store: Arc<MemStore>,
    iotype: IoType,
    pending: Vec<PendingWrite>,
}

impl MemBackend {
    /// Create a backend of the given kind over a shared store.
    pub fn new(store: Arc<MemStore>, iotype: IoType) -> Self {
        Self {
            store,
            iotype,
            pending: Vec::new(),
        }
    }

    fn deferred(&self) -> bool {
        self.iotype == IoType::ParallelV3
    }

    fn emit(&mut self, varid: i32, frame: i32, record_bytes: usize, off: usize, data: &[u8]) {
        if self.deferred() {
            self.pending.push(PendingWrite {
                varid,
                frame,
                record_bytes,
                off,
                data: data.to_vec(),
            });
        } else {
            self.store.write(varid, frame, record_bytes, off, data);
        }
    }
}

/// Maximal contiguous runs of a sorted global-index map, as
/// `(first_slot, first_global, length)`.
fn runs(map: &[usize]) -> Vec<(usize, usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < map.len() {
        let start = i;
        while i + 1 < map.len() && map[i + 1] == map[i] + 1 {
            i += 1;
        }
        out.push((start, map[start], i - start + 1));
        i += 1;
    }
    out
}

/// The staged map and stride a write mode addresses.
fn mode_view(iodesc: &IoDesc, mode: WriteMode) -> (&[usize], usize) {
    match mode {
        WriteMode::Data => (&iodesc.iomap, iodesc.llen),
        WriteMode::Fill => (&iodesc.fillmap, iodesc.holegridsize),
    }
}

impl Backend for MemBackend {
    fn write_darray_multi_par(
        &mut self,
        ios: &mut IoSystem,
        ctx: WriteCtx<'_>,
        mode: WriteMode,
    ) -> Result<()> {
        if !ios.ioproc() {
            return Ok(());
        }
        let (map, stride) = mode_view(ctx.iodesc, mode);
        let esz = ctx.iodesc.piotype_size;
        let record_bytes = ctx.iodesc.gsize * esz;
        let my_runs = runs(map);
        for v in 0..ctx.nvars {
            let frame = ctx.frames.map_or(-1, |f| f[v]);
            for &(slot0, g0, len) in &my_runs {
                let src = &ctx.buf[(v * stride + slot0) * esz..(v * stride + slot0 + len) * esz];
                self.emit(ctx.varids[v], frame, record_bytes, g0 * esz, src);
            }
        }
        tracing::debug!(nvars = ctx.nvars, ?mode, regions = my_runs.len(), "parallel write");
        Ok(())
    }

    fn write_darray_multi_serial(
        &mut self,
        ios: &mut IoSystem,
        ctx: WriteCtx<'_>,
        mode: WriteMode,
    ) -> Result<()> {
        if !ios.ioproc() {
            return Ok(());
        }
        let (map, stride) = mode_view(ctx.iodesc, mode);
        let esz = ctx.iodesc.piotype_size;
        let record_bytes = ctx.iodesc.gsize * esz;
        let num_iotasks = ios.num_iotasks();

        if ios.iomaster() {
            // The master writes its own regions, then services the
            // other tasks one at a time so only one task's payload is
            // in flight at once.
            let my_runs = runs(map);
            for v in 0..ctx.nvars {
                let frame = ctx.frames.map_or(-1, |f| f[v]);
                for &(slot0, g0, len) in &my_runs {
                    let src =
                        &ctx.buf[(v * stride + slot0) * esz..(v * stride + slot0 + len) * esz];
                    self.emit(ctx.varids[v], frame, record_bytes, g0 * esz, src);
                }
            }
            for t in 1..num_iotasks {
                let msg = ios.io().recv(t, SERIAL_TAG)?;
                let mut cur = msg.clone();
                let peer_stride = cur.get_u64_le() as usize;
                let nruns = cur.get_u64_le() as usize;
                let mut peer_runs = Vec::with_capacity(nruns);
                for _ in 0..nruns {
                    let slot0 = cur.get_u64_le() as usize;
                    let g0 = cur.get_u64_le() as usize;
                    let len = cur.get_u64_le() as usize;
                    peer_runs.push((slot0, g0, len));
                }
                let data = cur;
                for v in 0..ctx.nvars {
                    let frame = ctx.frames.map_or(-1, |f| f[v]);
                    for &(slot0, g0, len) in &peer_runs {
                        let off = (v * peer_stride + slot0) * esz;
                        self.emit(
                            ctx.varids[v],
                            frame,
                            record_bytes,
                            g0 * esz,
                            &data[off..off + len * esz],
                        );
                    }
                }
            }
        } else {
            let my_runs = runs(map);
            let mut msg = Vec::with_capacity(16 + my_runs.len() * 24 + ctx.buf.len());
            msg.put_u64_le(stride as u64);
            msg.put_u64_le(my_runs.len() as u64);
            for (slot0, g0, len) in &my_runs {
                msg.put_u64_le(*slot0 as u64);
                msg.put_u64_le(*g0 as u64);
                msg.put_u64_le(*len as u64);
            }
            msg.put_slice(&ctx.buf[..ctx.nvars * stride * esz]);
            let master = 0;
            ios.io().send(master, SERIAL_TAG, Bytes::from(msg))?;
        }
        Ok(())
    }

    fn read_darray_par(
        &mut self,
        ios: &mut IoSystem,
        varid: i32,
        frame: i32,
        iodesc: &IoDesc,
        iobuf: &mut [u8],
    ) -> Result<()> {
        if !ios.ioproc() {
            return Ok(());
        }
        let esz = iodesc.piotype_size;
        for (slot0, g0, len) in runs(&iodesc.iomap) {
            self.store.read(
                varid,
                frame,
                g0 * esz,
                &mut iobuf[slot0 * esz..(slot0 + len) * esz],
            )?;
        }
        Ok(())
    }

    fn read_darray_serial(
        &mut self,
        ios: &mut IoSystem,
        varid: i32,
        frame: i32,
        iodesc: &IoDesc,
        iobuf: &mut [u8],
    ) -> Result<()> {
        if !ios.ioproc() {
            return Ok(());
        }
        let esz = iodesc.piotype_size;
        let num_iotasks = ios.num_iotasks();
        if ios.iomaster() {
            for (slot0, g0, len) in runs(&iodesc.iomap) {
                self.store.read(
                    varid,
                    frame,
                    g0 * esz,
                    &mut iobuf[slot0 * esz..(slot0 + len) * esz],
                )?;
            }
            for t in 1..num_iotasks {
                let req = ios.io().recv(t, SERIAL_TAG)?;
                let mut cur = req.clone();
                let llen = cur.get_u64_le() as usize;
                let nruns = cur.get_u64_le() as usize;
                let mut reply = vec![0u8; llen * esz];
                for _ in 0..nruns {
                    let slot0 = cur.get_u64_le() as usize;
                    let g0 = cur.get_u64_le() as usize;
                    let len = cur.get_u64_le() as usize;
                    self.store.read(
                        varid,
                        frame,
                        g0 * esz,
                        &mut reply[slot0 * esz..(slot0 + len) * esz],
                    )?;
                }
                ios.io().send(t, SERIAL_TAG, Bytes::from(reply))?;
            }
        } else {
            let my_runs = runs(&iodesc.iomap);
            let mut req = Vec::with_capacity(16 + my_runs.len() * 24);
            req.put_u64_le(iodesc.llen as u64);
            req.put_u64_le(my_runs.len() as u64);
            for (slot0, g0, len) in &my_runs {
                req.put_u64_le(*slot0 as u64);
                req.put_u64_le(*g0 as u64);
                req.put_u64_le(*len as u64);
            }
            let master = 0;
            ios.io().send(master, SERIAL_TAG, Bytes::from(req))?;
            let data = ios.io().recv(master, SERIAL_TAG)?;
            iobuf[..data.len()].copy_from_slice(&data);
        }
        Ok(())
    }

    fn flush_output_buffer(&mut self, _ios: &mut IoSystem, _wait_for_disk: bool) -> Result<()> {
        for w in self.pending.drain(..) {
            self.store.write(w.varid, w.frame, w.record_bytes, w.off, &w.data);
        }
        Ok(())
    }
}
