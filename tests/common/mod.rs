//! Common test utilities for integration tests.

#![allow(dead_code)]

use pario::comm::{Comm, Fabric};
use pario::iosystem::IoSystem;
use std::sync::Arc;
use std::thread;

/// World shape for a scenario.
#[derive(Debug, Clone, Copy)]
pub struct WorldCfg {
    /// Number of compute tasks.
    pub ncomp: usize,
    /// Number of I/O tasks.
    pub nio: usize,
    /// Disjoint compute and I/O groups.
    pub async_io: bool,
}

impl WorldCfg {
    pub fn intracomm(ncomp: usize, nio: usize) -> Self {
        Self {
            ncomp,
            nio,
            async_io: false,
        }
    }

    pub fn async_split(ncomp: usize, nio: usize) -> Self {
        Self {
            ncomp,
            nio,
            async_io: true,
        }
    }
}

/// Spawn one thread per task, build each task's `IoSystem`, run `f`
/// on every task, and collect the results in union-rank order.
pub fn run_world<R, F>(cfg: WorldCfg, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(&mut IoSystem) -> R + Send + Sync + 'static,
{
    let f = Arc::new(f);
    if cfg.async_io {
        let n = cfg.ncomp + cfg.nio;
        let unions = Fabric::world(n);
        let mut comps: Vec<Option<Comm>> =
            Fabric::world(cfg.ncomp).into_iter().map(Some).collect();
        let mut ios_comms: Vec<Option<Comm>> =
            Fabric::world(cfg.nio).into_iter().map(Some).collect();
        let handles: Vec<_> = unions
            .into_iter()
            .enumerate()
            .map(|(r, u)| {
                let comp = if r < cfg.ncomp {
                    comps[r].take()
                } else {
                    None
                };
                let io = if r >= cfg.ncomp {
                    ios_comms[r - cfg.ncomp].take()
                } else {
                    None
                };
                let (ncomp, nio) = (cfg.ncomp, cfg.nio);
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    let mut ios = IoSystem::async_split(u, comp, io, ncomp, nio);
                    f(&mut ios)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    } else {
        let unions = Fabric::world(cfg.ncomp);
        let mut ios_comms: Vec<Option<Comm>> =
            Fabric::world(cfg.nio).into_iter().map(Some).collect();
        let handles: Vec<_> = unions
            .into_iter()
            .enumerate()
            .map(|(r, u)| {
                let io = if r < cfg.nio { ios_comms[r].take() } else { None };
                let nio = cfg.nio;
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    let mut ios = IoSystem::intracomm(u, io, nio);
                    f(&mut ios)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }
}

/// Encode a slice of f64 values as native bytes.
pub fn f64_bytes(vals: impl IntoIterator<Item = f64>) -> Vec<u8> {
    vals.into_iter().flat_map(f64::to_ne_bytes).collect()
}

/// Encode a slice of i32 values as native bytes.
pub fn i32_bytes(vals: impl IntoIterator<Item = i32>) -> Vec<u8> {
    vals.into_iter().flat_map(i32::to_ne_bytes).collect()
}

/// Decode a record of f64 values.
pub fn f64_record(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

/// Decode a record of i32 values.
pub fn i32_record(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}
