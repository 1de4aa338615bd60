//! In-process rank fabric over kanal channels.

use crate::error::{report, Error, Result};
use bytes::Bytes;
use std::collections::VecDeque;

/// Tag space reserved for collectives, above any point-to-point tag a
/// caller can reach.
const COLL_BASE: u64 = 1 << 32;

struct Envelope {
    src: usize,
    tag: u64,
    payload: Bytes,
}

/// Builder for a world of connected [`Comm`] endpoints.
///
/// # Example
///
/// ```rust
/// use pario::comm::Fabric;
/// use bytes::Bytes;
/// use std::thread;
///
/// let world = Fabric::world(2);
/// let handles: Vec<_> = world
///     .into_iter()
///     .map(|mut comm| {
///         thread::spawn(move || {
///             let peer = 1 - comm.rank();
///             comm.send(peer, 7, Bytes::from_static(b"hi")).unwrap();
///             comm.recv(peer, 7).unwrap()
///         })
///     })
///     .collect();
/// for h in handles {
///     assert_eq!(&h.join().unwrap()[..], b"hi");
/// }
/// ```
pub struct Fabric;

impl Fabric {
    /// Create `n` endpoints forming one world. Endpoint `i` has rank
    /// `i`; each is moved onto the thread that plays that task.
    pub fn world(n: usize) -> Vec<Comm> {
        assert!(n > 0, "world must have at least one rank");
        let mut txs = Vec::with_capacity(n);
        let mut rxs = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = kanal::unbounded::<Envelope>();
            txs.push(tx);
            rxs.push(rx);
        }
        rxs.into_iter()
            .enumerate()
            .map(|(rank, rx)| Comm {
                rank,
                size: n,
                txs: txs.clone(),
                rx,
                stash: VecDeque::new(),
                coll_seq: 0,
            })
            .collect()
    }
}

/// A handle for a posted receive; matched when waited.
///
/// A handle that is never waited simply never drains its message; the
/// exchange engine guarantees it waits every handle it posts.
#[derive(Debug, Clone, Copy)]
pub struct RecvHandle {
    peer: usize,
    tag: u64,
}

/// A handle for a non-blocking send.
///
/// Sends into the fabric complete immediately (channels are buffered),
/// so waiting is a no-op kept for symmetry with the posted-receive
/// discipline.
#[derive(Debug, Clone, Copy)]
pub struct SendHandle {
    _peer: usize,
}

impl SendHandle {
    /// Complete the send. Always succeeds.
    pub fn wait(self) -> Result<()> {
        Ok(())
    }
}

/// One task's endpoint in a world.
///
/// Not `Sync`: an endpoint belongs to exactly one task thread.
pub struct Comm {
    rank: usize,
    size: usize,
    txs: Vec<kanal::Sender<Envelope>>,
    rx: kanal::Receiver<Envelope>,
    /// Arrived-but-unmatched messages, in arrival order.
    stash: VecDeque<Envelope>,
    /// Collective sequence number; advances in lockstep on every rank
    /// because collectives are entered in the same order world-wide.
    coll_seq: u64,
}

impl Comm {
    /// This endpoint's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the world.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Send `payload` to `peer` with `tag`. Never blocks.
    pub fn send(&mut self, peer: usize, tag: u64, payload: Bytes) -> Result<()> {
        self.txs[peer]
            .send(Envelope {
                src: self.rank,
                tag,
                payload,
            })
            .map_err(|_| {
                report(Error::Comm {
                    peer,
                    tag,
                    reason: "channel closed".into(),
                })
            })
    }

    /// Non-blocking send. Completes immediately; the handle exists for
    /// the posted-request bookkeeping of the exchange engine.
    pub fn isend(&mut self, peer: usize, tag: u64, payload: Bytes) -> Result<SendHandle> {
        self.send(peer, tag, payload)?;
        Ok(SendHandle { _peer: peer })
    }

    /// Post a receive for `(peer, tag)`. Matching happens at
    /// [`Comm::wait`].
    pub fn irecv(&mut self, peer: usize, tag: u64) -> RecvHandle {
        RecvHandle { peer, tag }
    }

    /// Wait for a posted receive and return its payload.
    pub fn wait(&mut self, handle: RecvHandle) -> Result<Bytes> {
        self.recv(handle.peer, handle.tag)
    }

    /// Blocking receive from `(peer, tag)`.
    pub fn recv(&mut self, peer: usize, tag: u64) -> Result<Bytes> {
        if let Some(pos) = self
            .stash
            .iter()
            .position(|e| e.src == peer && e.tag == tag)
        {
            let env = self.stash.remove(pos).expect("position just found");
            return Ok(env.payload);
        }
        loop {
            let env = self.rx.recv().map_err(|_| {
                report(Error::Comm {
                    peer,
                    tag,
                    reason: "world torn down while receiving".into(),
                })
            })?;
            if env.src == peer && env.tag == tag {
                return Ok(env.payload);
            }
            self.stash.push_back(env);
        }
    }

    fn next_coll_tag(&mut self) -> u64 {
        self.coll_seq += 1;
        COLL_BASE + self.coll_seq
    }

    /// Broadcast bytes from `root` to every rank. The root passes
    /// `Some(payload)`; everyone gets the payload back.
    pub fn bcast(&mut self, root: usize, payload: Option<Bytes>) -> Result<Bytes> {
        let tag = self.next_coll_tag();
        if self.rank == root {
            let payload = payload.expect("broadcast root must provide a payload");
            for peer in 0..self.size {
                if peer != root {
                    self.send(peer, tag, payload.clone())?;
                }
            }
            Ok(payload)
        } else {
            self.recv(root, tag)
        }
    }

    /// Broadcast a single `i32` from `root`.
    pub fn bcast_i32(&mut self, root: usize, value: i32) -> Result<i32> {
        let payload = (self.rank == root).then(|| Bytes::copy_from_slice(&value.to_ne_bytes()));
        let out = self.bcast(root, payload)?;
        decode_i32(&out)
    }

    /// Broadcast a single `u64` from `root`.
    pub fn bcast_u64(&mut self, root: usize, value: u64) -> Result<u64> {
        let payload = (self.rank == root).then(|| Bytes::copy_from_slice(&value.to_ne_bytes()));
        let out = self.bcast(root, payload)?;
        let arr: [u8; 8] = out[..]
            .try_into()
            .map_err(|_| malformed(root, "u64 broadcast"))?;
        Ok(u64::from_ne_bytes(arr))
    }

    /// Max-reduction of one `i32` across the world; every rank gets the
    /// result. The load-bearing collective of the flush protocol.
    pub fn allreduce_max(&mut self, value: i32) -> Result<i32> {
        let tag = self.next_coll_tag();
        if self.rank == 0 {
            let mut acc = value;
            for peer in 1..self.size {
                let b = self.recv(peer, tag)?;
                acc = acc.max(decode_i32(&b)?);
            }
            self.bcast_i32(0, acc)
        } else {
            self.send(0, tag, Bytes::copy_from_slice(&value.to_ne_bytes()))?;
            self.bcast_i32(0, 0)
        }
    }

    /// Block until every rank has arrived.
    pub fn barrier(&mut self) -> Result<()> {
        self.allreduce_max(0).map(|_| ())
    }
}

fn decode_i32(b: &Bytes) -> Result<i32> {
    let arr: [u8; 4] = b[..].try_into().map_err(|_| malformed(0, "i32 message"))?;
    Ok(i32::from_ne_bytes(arr))
}

#[track_caller]
fn malformed(peer: usize, what: &str) -> Error {
    report(Error::Comm {
        peer,
        tag: 0,
        reason: format!("malformed {what}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_world<R, F>(n: usize, f: F) -> Vec<R>
    where
        R: Send + 'static,
        F: Fn(Comm) -> R + Send + Sync + 'static,
    {
        let f = std::sync::Arc::new(f);
        let handles: Vec<_> = Fabric::world(n)
            .into_iter()
            .map(|comm| {
                let f = std::sync::Arc::clone(&f);
                thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_send_recv_roundtrip() {
        spawn_world(2, |mut comm| {
            let peer = 1 - comm.rank();
            let msg = Bytes::copy_from_slice(&[comm.rank() as u8; 4]);
            comm.send(peer, 3, msg).unwrap();
            let got = comm.recv(peer, 3).unwrap();
            assert_eq!(&got[..], &[peer as u8; 4]);
        });
    }

    #[test]
    fn test_out_of_order_tags_stash() {
        spawn_world(2, |mut comm| {
            if comm.rank() == 0 {
                comm.send(1, 10, Bytes::from_static(b"first")).unwrap();
                comm.send(1, 11, Bytes::from_static(b"second")).unwrap();
            } else {
                // Receive in reverse tag order; the stash reorders.
                assert_eq!(&comm.recv(0, 11).unwrap()[..], b"second");
                assert_eq!(&comm.recv(0, 10).unwrap()[..], b"first");
            }
        });
    }

    #[test]
    fn test_fifo_per_source_and_tag() {
        spawn_world(2, |mut comm| {
            if comm.rank() == 0 {
                for i in 0..16u8 {
                    comm.send(1, 5, Bytes::copy_from_slice(&[i])).unwrap();
                }
            } else {
                for i in 0..16u8 {
                    assert_eq!(comm.recv(0, 5).unwrap()[0], i);
                }
            }
        });
    }

    #[test]
    fn test_self_send() {
        spawn_world(1, |mut comm| {
            comm.send(0, 9, Bytes::from_static(b"self")).unwrap();
            assert_eq!(&comm.recv(0, 9).unwrap()[..], b"self");
        });
    }

    #[test]
    fn test_bcast() {
        let results = spawn_world(4, |mut comm| {
            let payload = (comm.rank() == 1).then(|| Bytes::from_static(b"root says"));
            comm.bcast(1, payload).unwrap()
        });
        for r in results {
            assert_eq!(&r[..], b"root says");
        }
    }

    #[test]
    fn test_allreduce_max() {
        let results = spawn_world(4, |mut comm| {
            let local = [0, 2, 1, 0][comm.rank()];
            comm.allreduce_max(local).unwrap()
        });
        assert_eq!(results, vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_collectives_in_sequence() {
        let results = spawn_world(3, |mut comm| {
            let a = comm.allreduce_max(comm.rank() as i32).unwrap();
            comm.barrier().unwrap();
            let b = comm.bcast_i32(2, comm.rank() as i32 * 10).unwrap();
            (a, b)
        });
        assert_eq!(results, vec![(2, 20), (2, 20), (2, 20)]);
    }
}
