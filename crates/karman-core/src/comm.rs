// crates/karman-core/src/comm.rs

//! Rank-to-rank communication substrate.
//!
//! One process per rank is the deployment model; inside a process the ranks
//! of a test cluster are threads wired together with crossbeam channels.
//! Self-communication goes through the same channel as any other peer so the
//! exchange loop stays uniform.
//!
//! Messages are [`Payload`] records: entity indices in ascending order plus a
//! tightly packed value block. Collectives are built from point-to-point
//! gather-to-root plus broadcast, which keeps reduction order deterministic.

pub mod exchange;

pub use exchange::{start_exchange, ExchangeHandle, ExchangePlan, FieldLayout, Transform};

use crate::error::{CoreResult, KarmanError};
use crate::types::Scalar;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A packed message: `(entity_index, payload[])` records in ascending
/// entity order, split into an index block and a value block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Payload {
    /// Entity indices, ascending.
    pub entities: Vec<u64>,
    /// `entities.len() * stride` values, entity-major.
    pub values: Vec<Scalar>,
}

/// Reduction operator for collectives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    #[inline]
    fn fold(self, a: Scalar, b: Scalar) -> Scalar {
        match self {
            Self::Sum => a + b,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

/// Point-to-point plus collective communication between ranks.
pub trait Communicator: Send + Sync {
    /// Rank of the calling process, `0..size`.
    fn rank(&self) -> usize;

    /// Number of ranks in the communicator.
    fn size(&self) -> usize;

    /// Send `payload` to `to` under `tag`. Buffered; never blocks.
    fn send(&self, to: usize, tag: u64, payload: Payload) -> CoreResult<()>;

    /// Receive the next message from `from` under `tag`. Blocks.
    fn recv(&self, from: usize, tag: u64) -> CoreResult<Payload>;

    /// Element-wise allreduce of `vals` across all ranks.
    fn allreduce(&self, op: ReduceOp, vals: &mut [Scalar]) -> CoreResult<()>;

    /// Broadcast `vals` from `root` to all ranks.
    fn broadcast(&self, root: usize, vals: &mut [Scalar]) -> CoreResult<()>;
}

/// Tag bit reserved for internal collective traffic; user tags must not set it.
const COLLECTIVE_BIT: u64 = 1 << 63;

/// Allreduce a single scalar.
pub fn allreduce_scalar(comm: &dyn Communicator, op: ReduceOp, v: Scalar) -> CoreResult<Scalar> {
    let mut buf = [v];
    comm.allreduce(op, &mut buf)?;
    Ok(buf[0])
}

/// Sum an event counter across ranks. Counts are exact up to 2^53.
pub fn allreduce_count(comm: &dyn Communicator, n: u64) -> CoreResult<u64> {
    #[allow(clippy::cast_precision_loss)]
    let total = allreduce_scalar(comm, ReduceOp::Sum, n as Scalar)?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(total.round() as u64)
}

/// In-process communicator backed by crossbeam channels.
///
/// [`LocalComm::cluster`] wires `n` ranks into a full mesh (including a
/// self-channel per rank); [`LocalComm::solo`] is the single-rank case.
pub struct LocalComm {
    rank: usize,
    size: usize,
    /// Senders indexed by destination rank.
    senders: Vec<Sender<(u64, Payload)>>,
    /// Receivers indexed by source rank.
    receivers: Vec<Receiver<(u64, Payload)>>,
    /// Messages that arrived under a tag we were not waiting for.
    pending: Vec<Mutex<VecDeque<(u64, Payload)>>>,
}

impl LocalComm {
    /// A single-rank communicator with an in-memory self-channel.
    #[must_use]
    pub fn solo() -> Self {
        Self::cluster(1).pop().unwrap_or_else(|| unreachable!("cluster(1) is non-empty"))
    }

    /// Build `n` fully connected ranks. Each returned communicator is moved
    /// onto its own worker thread by the caller.
    #[must_use]
    pub fn cluster(n: usize) -> Vec<Self> {
        assert!(n > 0, "cluster needs at least one rank");
        // channels[src][dst]
        let mut txs: Vec<Vec<Option<Sender<(u64, Payload)>>>> = (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut rxs: Vec<Vec<Option<Receiver<(u64, Payload)>>>> = (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        for (src, tx_row) in txs.iter_mut().enumerate() {
            for dst in 0..n {
                let (tx, rx) = unbounded();
                tx_row[dst] = Some(tx);
                rxs[dst][src] = Some(rx);
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (tx_row, rx_row))| Self {
                rank,
                size: n,
                senders: tx_row.into_iter().flatten().collect(),
                receivers: rx_row.into_iter().flatten().collect(),
                pending: (0..n).map(|_| Mutex::new(VecDeque::new())).collect(),
            })
            .collect()
    }

    fn recv_tagged(&self, from: usize, tag: u64) -> CoreResult<Payload> {
        // Drain anything already buffered for this tag first.
        {
            let mut pend = self.pending[from].lock().map_err(|_| KarmanError::Comm("pending buffer poisoned".into()))?;
            if let Some(pos) = pend.iter().position(|(t, _)| *t == tag) {
                let (_, payload) = pend.remove(pos).unwrap_or_else(|| unreachable!("position came from iter"));
                return Ok(payload);
            }
        }
        loop {
            let (t, payload) = self.receivers[from]
                .recv()
                .map_err(|_| KarmanError::Comm(format!("rank {} hung up on rank {}", from, self.rank)))?;
            if t == tag {
                return Ok(payload);
            }
            let mut pend = self.pending[from].lock().map_err(|_| KarmanError::Comm("pending buffer poisoned".into()))?;
            pend.push_back((t, payload));
        }
    }
}

impl Communicator for LocalComm {
    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, to: usize, tag: u64, payload: Payload) -> CoreResult<()> {
        if to >= self.size {
            return Err(KarmanError::Comm(format!("send to rank {to} of {}", self.size)));
        }
        self.senders[to]
            .send((tag, payload))
            .map_err(|_| KarmanError::Comm(format!("rank {to} closed its mailbox")))
    }

    fn recv(&self, from: usize, tag: u64) -> CoreResult<Payload> {
        if from >= self.size {
            return Err(KarmanError::Comm(format!("recv from rank {from} of {}", self.size)));
        }
        self.recv_tagged(from, tag)
    }

    fn allreduce(&self, op: ReduceOp, vals: &mut [Scalar]) -> CoreResult<()> {
        if self.size == 1 {
            return Ok(());
        }
        let tag = COLLECTIVE_BIT | u64::from(matches!(op, ReduceOp::Min)) | (u64::from(matches!(op, ReduceOp::Max)) << 1);
        if self.rank == 0 {
            // Gather in ascending rank order so the fold is deterministic.
            for src in 1..self.size {
                let p = self.recv_tagged(src, tag)?;
                if p.values.len() != vals.len() {
                    return Err(KarmanError::Comm(format!(
                        "allreduce length mismatch: {} vs {}",
                        p.values.len(),
                        vals.len()
                    )));
                }
                for (a, b) in vals.iter_mut().zip(&p.values) {
                    *a = op.fold(*a, *b);
                }
            }
        } else {
            self.send(0, tag, Payload { entities: Vec::new(), values: vals.to_vec() })?;
        }
        self.broadcast(0, vals)
    }

    fn broadcast(&self, root: usize, vals: &mut [Scalar]) -> CoreResult<()> {
        if self.size == 1 {
            return Ok(());
        }
        let tag = COLLECTIVE_BIT | (1 << 2);
        if self.rank == root {
            for dst in 0..self.size {
                if dst != root {
                    self.send(dst, tag, Payload { entities: Vec::new(), values: vals.to_vec() })?;
                }
            }
        } else {
            let p = self.recv_tagged(root, tag)?;
            if p.values.len() != vals.len() {
                return Err(KarmanError::Comm("broadcast length mismatch".into()));
            }
            vals.copy_from_slice(&p.values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn solo_self_roundtrip() {
        let comm = LocalComm::solo();
        let p = Payload { entities: vec![0, 3, 7], values: vec![1.0, 2.0, 3.0] };
        comm.send(0, 42, p.clone()).unwrap();
        assert_eq!(comm.recv(0, 42).unwrap(), p);
    }

    #[test]
    fn allreduce_sum_min_max() {
        let comms = LocalComm::cluster(3);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    #[allow(clippy::cast_precision_loss)]
                    let mine = (c.rank() + 1) as Scalar;
                    let sum = allreduce_scalar(&c, ReduceOp::Sum, mine).unwrap();
                    let mn = allreduce_scalar(&c, ReduceOp::Min, mine).unwrap();
                    let mx = allreduce_scalar(&c, ReduceOp::Max, mine).unwrap();
                    (sum, mn, mx)
                })
            })
            .collect();
        for h in handles {
            let (sum, mn, mx) = h.join().unwrap();
            assert_eq!(sum, 6.0);
            assert_eq!(mn, 1.0);
            assert_eq!(mx, 3.0);
        }
    }

    #[test]
    fn out_of_order_tags_are_buffered() {
        let comm = LocalComm::solo();
        comm.send(0, 1, Payload { entities: vec![0], values: vec![10.0] }).unwrap();
        comm.send(0, 2, Payload { entities: vec![0], values: vec![20.0] }).unwrap();
        assert_eq!(comm.recv(0, 2).unwrap().values, vec![20.0]);
        assert_eq!(comm.recv(0, 1).unwrap().values, vec![10.0]);
    }
}
