//! File handles and variable descriptors.

use crate::backend::{Backend, IoType};
use crate::config;
use crate::dtype::ElemType;
use crate::error::{report, Error, Result};
use crate::iosystem::IoSystem;
use crate::memory::{BufferPool, PoolBlock};
use crate::wmb::WriteMultiBuffer;

/// Hard ceiling on variable ids.
pub const MAX_VARS: i32 = 8192;

/// Open mode of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Read only.
    Read,
    /// Read and write.
    Write,
}

/// Per-variable state.
pub struct VarDesc {
    /// Variable id.
    pub varid: i32,
    /// Element type.
    pub elem: ElemType,
    /// Element size in bytes in storage.
    pub type_size: usize,
    /// Number of dimensions in the file.
    pub ndims: usize,
    /// Current record index; `-1` for non-record variables. A value
    /// `>= 0` iff the variable has an unlimited dimension.
    pub record: i32,
    /// Cached fill value, derived lazily on first need.
    pub fillvalue: Option<Vec<u8>>,
    /// Whether fill is in use for this variable.
    pub use_fill: bool,
    /// Bytes of one global record of this variable; computed lazily.
    pub vrsize: u64,
    /// Bytes buffered for write but not yet on disk.
    pub wb_pend: u64,
    /// Bytes in flight for read.
    pub rb_pend: u64,
    /// Staged hole-fill buffer, owned by the nonblocking parallel
    /// backend between write and flush.
    pub(crate) fillbuf: Option<PoolBlock>,
}

impl VarDesc {
    /// The fill value for this variable: the cached one, or the
    /// element type's default, cached for future calls.
    pub fn find_fillvalue(&mut self) -> Result<&[u8]> {
        if self.fillvalue.is_none() {
            self.fillvalue = Some(self.elem.default_fill()?);
            self.use_fill = true;
        }
        Ok(self.fillvalue.as_deref().expect("just ensured"))
    }
}

/// An open file: backend kind, mode, variables, and the chain of
/// write-multi-buffers keyed by `(ioid, recordvar)`.
///
/// At most one I/O-side scratch buffer (`iobuf`) is outstanding per
/// file; the write path asserts this.
pub struct File {
    /// File id.
    pub ncid: i32,
    /// Backend kind.
    pub iotype: IoType,
    /// Open mode.
    pub mode: Mode,
    pub(crate) varlist: Vec<VarDesc>,
    /// The write-multi-buffer chain. Tiny in practice: one entry per
    /// distinct `(decomposition, recordvar)` pair used with this file.
    pub(crate) buffer: Vec<WriteMultiBuffer>,
    /// Outstanding I/O-side scratch buffer, present only between a
    /// nonblocking parallel write and its flush.
    pub(crate) iobuf: Option<PoolBlock>,
    /// Bytes buffered for write across all variables.
    pub wb_pend: u64,
    /// Bytes in flight for read across all variables.
    pub rb_pend: u64,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) pool: BufferPool,
    /// Snapshot of the buffer limit at creation; limit changes only
    /// apply to files opened afterwards.
    pub(crate) buffer_size_limit: usize,
}

impl File {
    /// Create a file handle over a backend.
    pub fn create(
        ios: &IoSystem,
        ncid: i32,
        iotype: IoType,
        mode: Mode,
        backend: Box<dyn Backend>,
    ) -> File {
        tracing::debug!(ncid, ?iotype, ?mode, "created file");
        File {
            ncid,
            iotype,
            mode,
            varlist: Vec::new(),
            buffer: Vec::new(),
            iobuf: None,
            wb_pend: 0,
            rb_pend: 0,
            backend,
            pool: ios.pool().clone(),
            buffer_size_limit: config::buffer_size_limit(),
        }
    }

    /// True when the file may be written.
    pub fn writable(&self) -> bool {
        self.mode == Mode::Write
    }

    /// Define a variable; returns its id. All tasks must define
    /// variables in the same order.
    pub fn def_var(&mut self, elem: ElemType, ndims: usize) -> i32 {
        let varid = self.varlist.len() as i32;
        self.varlist.push(VarDesc {
            varid,
            elem,
            type_size: elem.size(),
            ndims,
            record: -1,
            fillvalue: None,
            use_fill: false,
            vrsize: 0,
            wb_pend: 0,
            rb_pend: 0,
            fillbuf: None,
        });
        varid
    }

    /// Look up a variable.
    pub fn var(&self, varid: i32) -> Result<&VarDesc> {
        if varid < 0 || varid as usize >= self.varlist.len() {
            return Err(report(Error::BadId { kind: "variable", id: varid }));
        }
        Ok(&self.varlist[varid as usize])
    }

    /// Look up a variable mutably.
    pub fn var_mut(&mut self, varid: i32) -> Result<&mut VarDesc> {
        if varid < 0 || varid as usize >= self.varlist.len() {
            return Err(report(Error::BadId { kind: "variable", id: varid }));
        }
        Ok(&mut self.varlist[varid as usize])
    }

    /// Set a record variable's current record index. Must be called
    /// before writing a record variable.
    pub fn set_frame(&mut self, varid: i32, frame: i32) -> Result<()> {
        if frame < 0 {
            return Err(report(Error::Invalid(format!("negative frame {frame}"))));
        }
        self.var_mut(varid)?.record = frame;
        Ok(())
    }

    /// Advance a record variable to its next record.
    pub fn advance_frame(&mut self, varid: i32) -> Result<()> {
        self.var_mut(varid)?.record += 1;
        Ok(())
    }

    /// Find the cache entry for `(ioid, recordvar)`, creating it
    /// lazily on first use.
    pub(crate) fn wmb_index(&mut self, ioid: i32, recordvar: bool) -> usize {
        if let Some(i) = self
            .buffer
            .iter()
            .position(|w| w.ioid == ioid && w.recordvar == recordvar)
        {
            return i;
        }
        self.buffer.push(WriteMultiBuffer::new(ioid, recordvar));
        self.buffer.len() - 1
    }

    /// Number of queued payloads per cache entry, in chain order.
    pub fn buffer_depth(&self) -> Vec<usize> {
        self.buffer.iter().map(|w| w.num_arrays).collect()
    }

    /// Drain every non-empty write-multi-buffer through a disk flush
    /// and complete any deferred backend writes.
    pub fn sync(&mut self, ios: &mut IoSystem) -> Result<()> {
        for idx in 0..self.buffer.len() {
            if !self.buffer[idx].is_empty() {
                crate::flush::flush_buffer(ios, self, idx, true)?;
            }
        }
        if self.iotype == IoType::ParallelV3 && ios.ioproc() {
            crate::flush::flush_output_buffer(ios, self, true)?;
        }
        Ok(())
    }

    /// Sync and close, freeing the cache chain.
    pub fn close(mut self, ios: &mut IoSystem) -> Result<()> {
        self.sync(ios)?;
        self.buffer.clear();
        tracing::debug!(ncid = self.ncid, "closed file");
        Ok(())
    }
}
