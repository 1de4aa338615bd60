//! Decomposition descriptors.
//!
//! A decomposition maps one compute task's local tile onto the global
//! logical array and, derived from that, onto the contiguous regions
//! each I/O task is responsible for. The library consumes
//! decompositions as opaque descriptors; the builders here produce the
//! two standard shapes deterministically so every rank can construct
//! its own descriptor from shared arguments, without communication.

use crate::dtype::ElemType;

/// Which rearrangement strategy a decomposition uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearranger {
    /// Dense: every destination slot is covered by exactly one source
    /// contribution, optionally after pre-filling the destination.
    Box,
    /// Sparse: destination slots with no contribution are tracked as a
    /// holegrid and filled in a second pass.
    Subset,
}

/// One task's view of a decomposition.
///
/// Carries the element geometry, the derived aggregate bounds the flush
/// controller and the orchestrators consume, and the exchange maps the
/// rearranger feeds to the collective engine.
#[derive(Debug, Clone)]
pub struct IoDesc {
    /// Id under which the descriptor is registered; assigned by the
    /// I/O system.
    pub ioid: i32,
    /// Rearrangement strategy. Immutable after construction.
    pub rearranger: Rearranger,
    /// Element type.
    pub elem: ElemType,
    /// Element size in bytes in transport.
    pub mpitype_size: usize,
    /// Element size in bytes in storage.
    pub piotype_size: usize,
    /// Global logical array length in elements.
    pub gsize: usize,
    /// Elements local to this compute task.
    pub ndof: usize,
    /// Elements local to this I/O task (destination side).
    pub llen: usize,
    /// Maximum `llen` across all I/O tasks.
    pub maxiobuflen: usize,
    /// Maximum contiguous data runs an I/O task must issue.
    pub maxregions: usize,
    /// Maximum contiguous fill runs an I/O task must issue.
    pub maxfillregions: usize,
    /// Hole elements on this I/O task. Zero for `Box`.
    pub holegridsize: usize,
    /// Maximum `holegridsize` across all I/O tasks.
    pub maxholegridsize: usize,
    /// Whether fill values must be materialized in holes.
    pub needsfill: bool,

    /// Per I/O task: elements this compute task sends it.
    pub(crate) scount: Vec<usize>,
    /// Local element indices grouped by destination I/O task, ordered
    /// by destination slot within each group.
    pub(crate) sindex: Vec<usize>,
    /// Per compute task: elements this I/O task receives from it.
    pub(crate) rcount: Vec<usize>,
    /// Local region slots grouped by source compute task, flattened,
    /// in the sender's transmission order.
    pub(crate) rindex: Vec<usize>,
    /// Global index of each local region slot (length `llen`).
    pub(crate) iomap: Vec<usize>,
    /// Global index of each hole slot (length `holegridsize`).
    pub(crate) fillmap: Vec<usize>,
}

/// Number of maximal contiguous runs in a sorted index list.
fn region_count(map: &[usize]) -> usize {
    let mut runs = 0;
    let mut prev = None;
    for &g in map {
        if prev != Some(g.wrapping_sub(1)) {
            runs += 1;
        }
        prev = Some(g);
    }
    runs
}

/// Split `gsize` into `n` near-equal contiguous blocks; returns the
/// start of each block plus the end sentinel.
fn block_bounds(gsize: usize, n: usize) -> Vec<usize> {
    let mut bounds = Vec::with_capacity(n + 1);
    for i in 0..=n {
        bounds.push(i * gsize / n);
    }
    bounds
}

impl IoDesc {
    /// Dense block decomposition: compute task `c` of `ncomp` owns the
    /// `c`-th near-equal slice of the global array, and I/O task `t` of
    /// `nio` owns the `t`-th. Full coverage, no holes.
    pub fn block(
        gsize: usize,
        ncomp: usize,
        nio: usize,
        comp_rank: Option<usize>,
        io_rank: Option<usize>,
        elem: ElemType,
    ) -> IoDesc {
        let cb = block_bounds(gsize, ncomp);
        let compmaps: Vec<Vec<usize>> = (0..ncomp).map(|c| (cb[c]..cb[c + 1]).collect()).collect();
        Self::boxed(gsize, nio, &compmaps, comp_rank, io_rank, elem)
    }

    /// Dense decomposition from explicit per-compute-task index maps.
    ///
    /// Destination regions are the `nio` near-equal slices of the
    /// global array. Slots no compute task contributes to are handled
    /// by pre-filling the destination (`needsfill` is derived), not by
    /// a holegrid: `holegridsize` stays zero.
    pub fn boxed(
        gsize: usize,
        nio: usize,
        compmaps: &[Vec<usize>],
        comp_rank: Option<usize>,
        io_rank: Option<usize>,
        elem: ElemType,
    ) -> IoDesc {
        let ncomp = compmaps.len();
        let ib = block_bounds(gsize, nio);
        let io_of = |g: usize| -> usize {
            // Blocks are near-equal; scan is fine at builder time.
            (0..nio).find(|&t| g >= ib[t] && g < ib[t + 1]).expect("index in range")
        };

        let covered = compmaps.iter().map(|m| m.len()).sum::<usize>();
        let needsfill = covered < gsize;

        let (ndof, scount, sindex) = match comp_rank {
            Some(c) => compute_side(&compmaps[c], nio, |g| (io_of(g), g - ib[io_of(g)])),
            None => (0, vec![0; nio], Vec::new()),
        };

        let (llen, rcount, rindex, iomap) = match io_rank {
            Some(t) => {
                let iomap: Vec<usize> = (ib[t]..ib[t + 1]).collect();
                let (rcount, rindex) = io_side(compmaps, |g| {
                    (g >= ib[t] && g < ib[t + 1]).then(|| g - ib[t])
                });
                (iomap.len(), rcount, rindex, iomap)
            }
            None => (0, vec![0; ncomp], Vec::new(), Vec::new()),
        };

        let maxiobuflen = (0..nio).map(|t| ib[t + 1] - ib[t]).max().unwrap_or(0);

        IoDesc {
            ioid: -1,
            rearranger: Rearranger::Box,
            elem,
            mpitype_size: elem.size(),
            piotype_size: elem.size(),
            gsize,
            ndof,
            llen,
            maxiobuflen,
            maxregions: 1,
            maxfillregions: 0,
            holegridsize: 0,
            maxholegridsize: 0,
            needsfill,
            scount,
            sindex,
            rcount,
            rindex,
            iomap,
            fillmap: Vec::new(),
        }
    }

    /// Sparse decomposition: compute task `c` feeds exactly one I/O
    /// task, and each I/O task's region is the sorted union of its
    /// feeders' indices. Globals nobody contributes become the
    /// holegrid, apportioned to I/O tasks by contiguous span.
    pub fn subset(
        gsize: usize,
        nio: usize,
        compmaps: &[Vec<usize>],
        comp_rank: Option<usize>,
        io_rank: Option<usize>,
        elem: ElemType,
    ) -> IoDesc {
        let ncomp = compmaps.len();
        let io_of_comp = |c: usize| c * nio / ncomp;

        // Each I/O task's region, in global index order.
        let mut iomaps: Vec<Vec<usize>> = vec![Vec::new(); nio];
        for (c, map) in compmaps.iter().enumerate() {
            iomaps[io_of_comp(c)].extend_from_slice(map);
        }
        for m in &mut iomaps {
            m.sort_unstable();
        }

        // Hole spans: from each region's start to the next region's,
        // so the spans tile the whole global array.
        let mut span_bounds = vec![0usize; nio + 1];
        span_bounds[nio] = gsize;
        for t in 1..nio {
            span_bounds[t] = iomaps[t].first().copied().unwrap_or(span_bounds[t - 1].max(t * gsize / nio));
        }
        let mut fillmaps: Vec<Vec<usize>> = Vec::with_capacity(nio);
        for t in 0..nio {
            let mut holes = Vec::new();
            let mut it = iomaps[t].iter().copied().peekable();
            for g in span_bounds[t]..span_bounds[t + 1] {
                while it.peek().is_some_and(|&h| h < g) {
                    it.next();
                }
                if it.peek() != Some(&g) {
                    holes.push(g);
                }
            }
            fillmaps.push(holes);
        }

        let total_holes: usize = fillmaps.iter().map(|f| f.len()).sum();
        let needsfill = total_holes > 0;

        let (ndof, scount, sindex) = match comp_rank {
            Some(c) => {
                let t = io_of_comp(c);
                let iomap = &iomaps[t];
                compute_side(&compmaps[c], nio, |g| {
                    (t, iomap.binary_search(&g).expect("element in region"))
                })
            }
            None => (0, vec![0; nio], Vec::new()),
        };

        let (llen, rcount, rindex, iomap, fillmap) = match io_rank {
            Some(t) => {
                let iomap = iomaps[t].clone();
                let feeders: Vec<usize> =
                    (0..ncomp).filter(|&c| io_of_comp(c) == t).collect();
                let (rcount, rindex) = io_side(compmaps, |g| {
                    iomap.binary_search(&g).ok()
                });
                // Sanity: only feeders may land here.
                debug_assert!((0..ncomp)
                    .filter(|c| !feeders.contains(c))
                    .all(|c| rcount[c] == 0));
                (iomap.len(), rcount, rindex, iomap, fillmaps[t].clone())
            }
            None => (0, vec![0; ncomp], Vec::new(), Vec::new(), Vec::new()),
        };

        let maxiobuflen = iomaps.iter().map(|m| m.len()).max().unwrap_or(0);
        let maxholegridsize = fillmaps.iter().map(|f| f.len()).max().unwrap_or(0);
        let maxregions = iomaps.iter().map(|m| region_count(m)).max().unwrap_or(0);
        let maxfillregions = fillmaps.iter().map(|f| region_count(f)).max().unwrap_or(0);

        IoDesc {
            ioid: -1,
            rearranger: Rearranger::Subset,
            elem,
            mpitype_size: elem.size(),
            piotype_size: elem.size(),
            gsize,
            ndof,
            llen,
            maxiobuflen,
            maxregions,
            maxfillregions,
            holegridsize: fillmap.len(),
            maxholegridsize,
            needsfill,
            scount,
            sindex,
            rcount,
            rindex,
            iomap,
            fillmap,
        }
    }
}

/// Build the compute-side maps: per-destination counts and the local
/// element order, grouped by I/O task and sorted by destination slot.
fn compute_side(
    compmap: &[usize],
    nio: usize,
    dest: impl Fn(usize) -> (usize, usize),
) -> (usize, Vec<usize>, Vec<usize>) {
    let ndof = compmap.len();
    let mut tagged: Vec<(usize, usize, usize)> = compmap
        .iter()
        .enumerate()
        .map(|(i, &g)| {
            let (t, slot) = dest(g);
            (t, slot, i)
        })
        .collect();
    tagged.sort_unstable();
    let mut scount = vec![0usize; nio];
    let mut sindex = Vec::with_capacity(ndof);
    for (t, _slot, i) in tagged {
        scount[t] += 1;
        sindex.push(i);
    }
    (ndof, scount, sindex)
}

/// Build the I/O-side maps: per-source counts and the local slots in
/// each sender's transmission order.
fn io_side(
    compmaps: &[Vec<usize>],
    slot_of: impl Fn(usize) -> Option<usize>,
) -> (Vec<usize>, Vec<usize>) {
    let mut rcount = vec![0usize; compmaps.len()];
    let mut rindex = Vec::new();
    for (c, map) in compmaps.iter().enumerate() {
        // The sender transmits its elements sorted by destination slot.
        let mut slots: Vec<usize> = map.iter().filter_map(|&g| slot_of(g)).collect();
        slots.sort_unstable();
        rcount[c] = slots.len();
        rindex.extend(slots);
    }
    (rcount, rindex)
}
