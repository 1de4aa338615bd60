//! The write-multi-buffer: the compute-side aggregation cache.

use crate::error::Result;
use crate::memory::{BufferPool, PoolBlock};

/// Aggregation cache entry keyed by `(ioid, recordvar)`.
///
/// Queues one or more variable payloads that share a decomposition,
/// element size, and record-ness, so a single flush rearranges and
/// writes them together. The parallel arrays `vid`, `frame`, and the
/// per-variable fill values all have `num_arrays` entries; `data` is
/// one contiguous block of `num_arrays * arraylen` elements.
///
/// Contents are never observed by I/O tasks before a flush.
pub struct WriteMultiBuffer {
    /// Decomposition id every queued payload uses.
    pub ioid: i32,
    /// Whether the queued variables are record variables.
    pub recordvar: bool,
    /// Number of payloads queued.
    pub num_arrays: usize,
    /// Element count shared by every queued payload.
    pub arraylen: usize,
    /// Variable id per payload.
    pub vid: Vec<i32>,
    /// Record index per payload; allocated iff the variables are
    /// record variables.
    pub frame: Option<Vec<i32>>,
    /// Element-sized fill value per payload, back to back.
    pub fillvalue: Option<PoolBlock>,
    /// The payloads, back to back.
    pub data: Option<PoolBlock>,
}

impl WriteMultiBuffer {
    /// Create an empty cache entry for `(ioid, recordvar)`.
    pub fn new(ioid: i32, recordvar: bool) -> Self {
        Self {
            ioid,
            recordvar,
            num_arrays: 0,
            arraylen: 0,
            vid: Vec::new(),
            frame: None,
            fillvalue: None,
            data: None,
        }
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.num_arrays == 0
    }

    /// Queue one payload.
    ///
    /// Grows `data` in place by exactly `arraylen * elem_size` bytes
    /// and copies the payload's first `arraylen` elements in. The
    /// caller has already run the flush decision; a failed grow leaves
    /// previously queued payloads intact.
    pub fn append(
        &mut self,
        pool: &BufferPool,
        elem_size: usize,
        arraylen: usize,
        varid: i32,
        payload: &[u8],
        fillvalue: Option<&[u8]>,
        frame: Option<i32>,
    ) -> Result<()> {
        debug_assert!(
            self.num_arrays == 0 || self.arraylen == arraylen,
            "payload length disagrees with queued payloads"
        );
        debug_assert_eq!(self.recordvar, frame.is_some());

        let array_bytes = arraylen * elem_size;
        if array_bytes > 0 {
            let need = (1 + self.num_arrays) * array_bytes;
            match &mut self.data {
                Some(block) => pool.grow(block, need)?,
                None => self.data = Some(pool.acquire(need)?),
            }
        }

        if let Some(fill) = fillvalue {
            let need = (1 + self.num_arrays) * elem_size;
            match &mut self.fillvalue {
                Some(block) => pool.grow(block, need)?,
                None => self.fillvalue = Some(pool.acquire(need)?),
            }
            let block = self.fillvalue.as_mut().expect("just ensured");
            block.as_mut_slice()[self.num_arrays * elem_size..(1 + self.num_arrays) * elem_size]
                .copy_from_slice(&fill[..elem_size]);
        }

        if array_bytes > 0 {
            let block = self.data.as_mut().expect("just ensured");
            let dst = &mut block.as_mut_slice()[self.num_arrays * array_bytes..];
            dst[..array_bytes].copy_from_slice(&payload[..array_bytes]);
        }

        self.vid.push(varid);
        if let Some(f) = frame {
            self.frame.get_or_insert_with(Vec::new).push(f);
        }
        self.arraylen = arraylen;
        self.num_arrays += 1;
        tracing::trace!(
            ioid = self.ioid,
            varid,
            num_arrays = self.num_arrays,
            arraylen,
            "queued payload"
        );
        Ok(())
    }

    /// Drop all queued payloads and return the cache storage to the
    /// pool. The entry itself stays and can be appended to again.
    pub fn reset(&mut self) {
        self.num_arrays = 0;
        self.arraylen = 0;
        self.vid.clear();
        self.frame = None;
        self.fillvalue = None;
        self.data = None;
    }
}
