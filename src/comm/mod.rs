//! Message-passing fabric between tasks.
//!
//! Tasks are single-threaded and advance through blocking and
//! non-blocking message operations; a [`Fabric`] wires `n` of them into
//! one world. Matching is FIFO per `(source, tag)` pair. On top of the
//! point-to-point layer sit the small set of collectives the write path
//! needs (broadcast, max-reduction, barrier) and the variable-size
//! all-to-all exchange engine ([`swapm`]) used by the rearranger.

mod fabric;
mod swapm;

pub use fabric::{Comm, Fabric, RecvHandle, SendHandle};
pub use swapm::{ceil2, fc_gather, pair, swapm, ExchangePlan, SwapmOpts};
