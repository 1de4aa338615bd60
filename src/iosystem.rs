//! The I/O system: communicators, roles, and shared per-task state.

use crate::comm::Comm;
use crate::config::RearrOpts;
use crate::decomp::IoDesc;
use crate::error::{report, Error, Result};
use crate::memory::BufferPool;
use std::collections::HashMap;
use std::sync::Arc;

/// One task's handle on an I/O system.
///
/// Groups the compute, I/O, and union communicators, this task's role
/// bits, the task-wide buffer pool shared by every file, and the
/// registry of decompositions. Every task belongs to exactly one of
/// compute-only, I/O-only, or both; the constructors check that the
/// role bits agree with communicator membership.
pub struct IoSystem {
    pub(crate) union_comm: Comm,
    /// `None` when the compute communicator is the union communicator
    /// (the intracomm case).
    comp_comm: Option<Comm>,
    io_comm: Option<Comm>,
    async_interface: bool,
    num_comptasks: usize,
    num_iotasks: usize,
    comp_rank: Option<usize>,
    io_rank: Option<usize>,
    pool: BufferPool,
    /// Exchange-engine tuning applied to every rearrangement.
    pub rearr_opts: RearrOpts,
    decomps: HashMap<i32, Arc<IoDesc>>,
    next_ioid: i32,
}

impl IoSystem {
    /// Build an intracomm system: every task computes, and the first
    /// `num_iotasks` union ranks also perform I/O. `io_comm` must be
    /// `Some` exactly on those ranks.
    pub fn intracomm(union_comm: Comm, io_comm: Option<Comm>, num_iotasks: usize) -> IoSystem {
        let union_rank = union_comm.rank();
        let ncomp = union_comm.size();
        assert!(num_iotasks > 0 && num_iotasks <= ncomp, "bad io task count");
        let is_io = union_rank < num_iotasks;
        assert_eq!(is_io, io_comm.is_some(), "io role disagrees with membership");
        if let Some(io) = &io_comm {
            assert_eq!(io.size(), num_iotasks);
            assert_eq!(io.rank(), union_rank);
        }
        IoSystem {
            union_comm,
            comp_comm: None,
            io_rank: io_comm.as_ref().map(|c| c.rank()),
            io_comm,
            async_interface: false,
            num_comptasks: ncomp,
            num_iotasks,
            comp_rank: Some(union_rank),
            pool: BufferPool::new(),
            rearr_opts: RearrOpts::default(),
            decomps: HashMap::new(),
            next_ioid: 512,
        }
    }

    /// Build an async system: union ranks `[0, num_comptasks)` are
    /// compute tasks, the rest are dedicated I/O tasks, and the groups
    /// are disjoint.
    pub fn async_split(
        union_comm: Comm,
        comp_comm: Option<Comm>,
        io_comm: Option<Comm>,
        num_comptasks: usize,
        num_iotasks: usize,
    ) -> IoSystem {
        let union_rank = union_comm.rank();
        assert_eq!(union_comm.size(), num_comptasks + num_iotasks);
        let is_comp = union_rank < num_comptasks;
        assert_eq!(is_comp, comp_comm.is_some(), "compute role disagrees with membership");
        assert_eq!(!is_comp, io_comm.is_some(), "io role disagrees with membership");
        if let Some(c) = &comp_comm {
            assert_eq!(c.size(), num_comptasks);
            assert_eq!(c.rank(), union_rank);
        }
        if let Some(c) = &io_comm {
            assert_eq!(c.size(), num_iotasks);
            assert_eq!(c.rank(), union_rank - num_comptasks);
        }
        IoSystem {
            comp_rank: comp_comm.as_ref().map(|c| c.rank()),
            io_rank: io_comm.as_ref().map(|c| c.rank()),
            union_comm,
            comp_comm,
            io_comm,
            async_interface: true,
            num_comptasks,
            num_iotasks,
            pool: BufferPool::new(),
            rearr_opts: RearrOpts::default(),
            decomps: HashMap::new(),
            next_ioid: 512,
        }
    }

    /// Replace the task-wide buffer pool. Applies to files created
    /// afterwards; existing files keep their handle on the old pool.
    pub fn set_pool(&mut self, pool: BufferPool) {
        self.pool = pool;
    }

    /// The task-wide buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// True when compute and I/O tasks are disjoint groups.
    pub fn is_async(&self) -> bool {
        self.async_interface
    }

    /// True when this task participates in actual I/O.
    pub fn ioproc(&self) -> bool {
        self.io_rank.is_some()
    }

    /// True when this task is a compute task.
    pub fn compproc(&self) -> bool {
        self.comp_rank.is_some()
    }

    /// True when this task is rank 0 of the I/O communicator.
    pub fn iomaster(&self) -> bool {
        self.io_rank == Some(0)
    }

    /// True when this task is rank 0 of the compute communicator.
    pub fn compmaster(&self) -> bool {
        self.comp_rank == Some(0)
    }

    /// This task's rank in the union communicator.
    pub fn union_rank(&self) -> usize {
        self.union_comm.rank()
    }

    /// Number of compute tasks.
    pub fn num_comptasks(&self) -> usize {
        self.num_comptasks
    }

    /// Number of I/O tasks.
    pub fn num_iotasks(&self) -> usize {
        self.num_iotasks
    }

    /// This task's rank in the compute communicator, if any.
    pub fn comp_rank(&self) -> Option<usize> {
        self.comp_rank
    }

    /// This task's rank in the I/O communicator, if any.
    pub fn io_rank(&self) -> Option<usize> {
        self.io_rank
    }

    /// Union rank of compute task `c`.
    pub(crate) fn comp_union_rank(&self, c: usize) -> usize {
        c
    }

    /// Union rank of I/O task `t`.
    pub(crate) fn io_union_rank(&self, t: usize) -> usize {
        if self.async_interface {
            self.num_comptasks + t
        } else {
            t
        }
    }

    /// Union rank of the compute master.
    pub(crate) fn comproot_union(&self) -> usize {
        0
    }

    /// Union rank of the I/O master.
    pub(crate) fn ioroot_union(&self) -> usize {
        self.io_union_rank(0)
    }

    /// The compute communicator (the union communicator in the
    /// intracomm case). Must only be called on compute tasks.
    pub(crate) fn comp(&mut self) -> &mut Comm {
        debug_assert!(self.compproc(), "not a compute task");
        self.comp_comm.as_mut().unwrap_or(&mut self.union_comm)
    }

    /// The I/O communicator. Must only be called on I/O tasks.
    pub(crate) fn io(&mut self) -> &mut Comm {
        debug_assert!(self.ioproc(), "not an io task");
        self.io_comm.as_mut().expect("io communicator")
    }

    /// Register a decomposition and return its id.
    ///
    /// The descriptor's rearranger and geometry are immutable once
    /// registered; all tasks must register in the same order so ids
    /// agree across the system.
    pub fn define_decomp(&mut self, mut iodesc: IoDesc) -> i32 {
        let ioid = self.next_ioid;
        self.next_ioid += 1;
        iodesc.ioid = ioid;
        tracing::debug!(
            ioid,
            rearranger = ?iodesc.rearranger,
            ndof = iodesc.ndof,
            llen = iodesc.llen,
            maxiobuflen = iodesc.maxiobuflen,
            "registered decomposition"
        );
        self.decomps.insert(ioid, Arc::new(iodesc));
        ioid
    }

    /// Look up a decomposition by id.
    pub fn decomp(&self, ioid: i32) -> Result<Arc<IoDesc>> {
        self.decomps
            .get(&ioid)
            .cloned()
            .ok_or_else(|| report(Error::BadId { kind: "decomposition", id: ioid }))
    }

    /// Forget a decomposition.
    pub fn free_decomp(&mut self, ioid: i32) -> Result<()> {
        self.decomps
            .remove(&ioid)
            .map(|_| ())
            .ok_or_else(|| report(Error::BadId { kind: "decomposition", id: ioid }))
    }
}
