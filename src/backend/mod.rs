//! The file-format backend contract.
//!
//! The core never encodes the array format itself; it stages payload
//! into I/O-side scratch buffers and hands them to a backend through
//! the narrow write contract below. Four backend kinds exist: serial
//! and parallel flavors of the classic (v3) and enhanced (v4) formats.
//! Only the nonblocking parallel classic kind defers completion, and
//! it owns the staged buffers until its explicit flush returns.

mod mem;

pub use mem::{MemBackend, MemStore};

use crate::decomp::IoDesc;
use crate::error::{report, Error, Result};
use crate::iosystem::IoSystem;

/// Backend kind of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Serial classic format: the I/O master funnels every task's
    /// payload and writes alone.
    SerialV3,
    /// Serial enhanced format.
    SerialV4,
    /// Parallel classic format with nonblocking buffered writes;
    /// completion is deferred to [`Backend::flush_output_buffer`].
    ParallelV3,
    /// Parallel enhanced format.
    ParallelV4,
}

impl IoType {
    /// True for the parallel kinds.
    pub fn is_parallel(self) -> bool {
        matches!(self, IoType::ParallelV3 | IoType::ParallelV4)
    }

    /// True for the serial kinds.
    pub fn is_serial(self) -> bool {
        !self.is_parallel()
    }

    /// Wire tag of this kind.
    pub fn tag(self) -> i32 {
        match self {
            IoType::SerialV3 => 1,
            IoType::SerialV4 => 2,
            IoType::ParallelV3 => 3,
            IoType::ParallelV4 => 4,
        }
    }

    /// Decode a wire tag.
    pub fn from_tag(tag: i32) -> Result<Self> {
        match tag {
            1 => Ok(IoType::SerialV3),
            2 => Ok(IoType::SerialV4),
            3 => Ok(IoType::ParallelV3),
            4 => Ok(IoType::ParallelV4),
            other => Err(report(Error::BadIoType(other))),
        }
    }
}

/// Whether a write carries user data or hole fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The staged buffer holds rearranged user payload (stride
    /// `llen`, destinations from the region map).
    Data,
    /// The staged buffer holds fill values (stride `holegridsize`,
    /// destinations from the hole map).
    Fill,
}

/// Everything a backend needs to issue one multi-variable write.
pub struct WriteCtx<'a> {
    /// Number of variables staged.
    pub nvars: usize,
    /// Number of dimensions of the variables in the file.
    pub fndims: usize,
    /// Variable ids, one per staged variable.
    pub varids: &'a [i32],
    /// Record index per variable; `None` for non-record variables.
    pub frames: Option<&'a [i32]>,
    /// The decomposition being written.
    pub iodesc: &'a IoDesc,
    /// The staged buffer: `iobuf` for [`WriteMode::Data`], `fillbuf`
    /// for [`WriteMode::Fill`]. Variable-major.
    pub buf: &'a [u8],
}

/// The narrow write contract every file-format adapter implements.
///
/// All methods are collective over the I/O communicator: every I/O
/// task enters them together, non-I/O tasks are no-ops inside.
pub trait Backend: Send {
    /// Write staged data where every I/O task writes its own regions.
    fn write_darray_multi_par(
        &mut self,
        ios: &mut IoSystem,
        ctx: WriteCtx<'_>,
        mode: WriteMode,
    ) -> Result<()>;

    /// Write staged data by funneling every I/O task's payload through
    /// the I/O master, one task at a time.
    fn write_darray_multi_serial(
        &mut self,
        ios: &mut IoSystem,
        ctx: WriteCtx<'_>,
        mode: WriteMode,
    ) -> Result<()>;

    /// Read one variable's regions into `iobuf` (stride `llen`), every
    /// I/O task reading its own regions.
    fn read_darray_par(
        &mut self,
        ios: &mut IoSystem,
        varid: i32,
        frame: i32,
        iodesc: &IoDesc,
        iobuf: &mut [u8],
    ) -> Result<()>;

    /// Read one variable's regions into `iobuf`, the I/O master
    /// reading on behalf of every task.
    fn read_darray_serial(
        &mut self,
        ios: &mut IoSystem,
        varid: i32,
        frame: i32,
        iodesc: &IoDesc,
        iobuf: &mut [u8],
    ) -> Result<()>;

    /// Complete deferred writes. Only meaningful for the nonblocking
    /// parallel kind; others return immediately.
    fn flush_output_buffer(&mut self, ios: &mut IoSystem, wait_for_disk: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iotype_tags_roundtrip() {
        for t in [
            IoType::SerialV3,
            IoType::SerialV4,
            IoType::ParallelV3,
            IoType::ParallelV4,
        ] {
            assert_eq!(IoType::from_tag(t.tag()).unwrap(), t);
        }
        assert!(matches!(IoType::from_tag(9), Err(Error::BadIoType(9))));
    }

    #[test]
    fn test_iotype_parallel_split() {
        assert!(IoType::ParallelV3.is_parallel());
        assert!(IoType::ParallelV4.is_parallel());
        assert!(IoType::SerialV3.is_serial());
        assert!(IoType::SerialV4.is_serial());
    }
}
