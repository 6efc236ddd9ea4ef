// crates/karman-core/src/comm/exchange.rs

//! Halo exchange engine.
//!
//! A mesh hands out an [`ExchangePlan`] (send/recv rank lists with per-rank
//! entity index lists, fixed after partitioning); fields are exchanged with
//! an explicit begin/wait pair:
//!
//! ```ignore
//! let handle = start_exchange(&comm, &plan, layout, &field, TAG_SOLUTION)?;
//! // ... rank-local work that does not read neighbor fields ...
//! handle.wait(&comm, &mut field)?;
//! ```
//!
//! The wait is the single suspension point: nothing reads halo entries
//! between `start_exchange` and `wait`. Periodic halos rotate the vector
//! components of each record through the marker transform during unpack.

use super::{Communicator, Payload};
use crate::error::{CoreResult, KarmanError};
use crate::types::{Scalar, MAX_DIM};

/// Rigid transformation attached to a periodic marker pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Transform {
    /// Rotation matrix (row-major, zero-padded for 2-D).
    pub rotation: [[Scalar; MAX_DIM]; MAX_DIM],
    /// Translation, applied to coordinates only (not to vector fields).
    pub translation: [Scalar; MAX_DIM],
}

impl Transform {
    /// Identity transform; index 0 of every plan.
    #[must_use]
    pub fn identity() -> Self {
        let mut rotation = [[0.0; MAX_DIM]; MAX_DIM];
        for (d, row) in rotation.iter_mut().enumerate() {
            row[d] = 1.0;
        }
        Self { rotation, translation: [0.0; MAX_DIM] }
    }

    /// Planar rotation about the z-axis by `theta` radians.
    #[must_use]
    pub fn rotation_z(theta: Scalar) -> Self {
        let (s, c) = theta.sin_cos();
        let mut t = Self::identity();
        t.rotation[0] = [c, -s, 0.0];
        t.rotation[1] = [s, c, 0.0];
        t
    }

    /// Rotate the first `n_dim` components of `v` in place.
    pub fn apply_vector(&self, v: &mut [Scalar], n_dim: usize) {
        let mut out = [0.0; MAX_DIM];
        for d in 0..n_dim {
            for (k, vk) in v.iter().take(n_dim).enumerate() {
                out[d] += self.rotation[d][k] * vk;
            }
        }
        v[..n_dim].copy_from_slice(&out[..n_dim]);
    }
}

/// Send/receive schedule for one partitioned mesh. Fixed after partitioning;
/// the exchange order over `ranks_send`/`ranks_recv` is deterministic.
#[derive(Clone, Debug, Default)]
pub struct ExchangePlan {
    /// Ranks we send to, ascending (self included when it owns our halos' donors).
    pub ranks_send: Vec<usize>,
    /// Ranks we receive from, ascending.
    pub ranks_recv: Vec<usize>,
    /// Per send-rank: owned entity indices to pack, ascending.
    pub entities_send: Vec<Vec<usize>>,
    /// Per recv-rank: halo entity indices to fill, ascending.
    pub entities_recv: Vec<Vec<usize>>,
    /// Per recv-rank, per entity: index into `transforms` (0 = identity).
    pub transform_recv: Vec<Vec<u32>>,
    /// Periodic transforms; entry 0 is the identity.
    pub transforms: Vec<Transform>,
}

impl ExchangePlan {
    /// Empty plan with only the identity transform (single-rank meshes).
    #[must_use]
    pub fn empty() -> Self {
        Self { transforms: vec![Transform::identity()], ..Self::default() }
    }

    /// Total number of halo entities this plan fills.
    #[must_use]
    pub fn n_halo(&self) -> usize {
        self.entities_recv.iter().map(Vec::len).sum()
    }
}

/// Record layout of an exchanged field.
#[derive(Clone, Copy, Debug)]
pub struct FieldLayout {
    /// Values per entity.
    pub stride: usize,
    /// `(offset, len)` of the vector components within the record, if the
    /// field transforms like a vector under periodic rotation.
    pub vector_comps: Option<(usize, usize)>,
}

impl FieldLayout {
    /// Scalar field layout (no rotation on unpack).
    #[must_use]
    pub const fn scalar(stride: usize) -> Self {
        Self { stride, vector_comps: None }
    }

    /// Field whose components `offset..offset+n_dim` rotate as a vector.
    #[must_use]
    pub const fn with_vector(stride: usize, offset: usize, n_dim: usize) -> Self {
        Self { stride, vector_comps: Some((offset, n_dim)) }
    }
}

/// In-flight exchange; completed by [`ExchangeHandle::wait`].
#[must_use = "an exchange must be completed with wait()"]
pub struct ExchangeHandle<'p> {
    plan: &'p ExchangePlan,
    layout: FieldLayout,
    tag: u64,
}

/// Pack and post all sends for `data`; receives are deferred to `wait`.
pub fn start_exchange<'p>(
    comm: &dyn Communicator,
    plan: &'p ExchangePlan,
    layout: FieldLayout,
    data: &[Scalar],
    tag: u64,
) -> CoreResult<ExchangeHandle<'p>> {
    for (slot, &to) in plan.ranks_send.iter().enumerate() {
        let ents = &plan.entities_send[slot];
        let mut payload = Payload {
            entities: Vec::with_capacity(ents.len()),
            values: Vec::with_capacity(ents.len() * layout.stride),
        };
        for &e in ents {
            payload.entities.push(e as u64);
            let rec = &data[e * layout.stride..(e + 1) * layout.stride];
            payload.values.extend_from_slice(rec);
        }
        comm.send(to, tag, payload)?;
    }
    Ok(ExchangeHandle { plan, layout, tag })
}

impl ExchangeHandle<'_> {
    /// Complete the exchange: receive from every peer in plan order and
    /// unpack into the halo entries of `data`, rotating vector components
    /// of periodic records.
    pub fn wait(self, comm: &dyn Communicator, data: &mut [Scalar]) -> CoreResult<()> {
        let stride = self.layout.stride;
        for (slot, &from) in self.plan.ranks_recv.iter().enumerate() {
            let payload = comm.recv(from, self.tag)?;
            let ents = &self.plan.entities_recv[slot];
            if payload.entities.len() != ents.len() || payload.values.len() != ents.len() * stride {
                return Err(KarmanError::Comm(format!(
                    "halo payload from rank {from}: got {} records, expected {}",
                    payload.entities.len(),
                    ents.len()
                )));
            }
            for (k, &halo) in ents.iter().enumerate() {
                let src = &payload.values[k * stride..(k + 1) * stride];
                let dst = &mut data[halo * stride..(halo + 1) * stride];
                dst.copy_from_slice(src);
                let t_idx = self.plan.transform_recv[slot][k] as usize;
                if t_idx != 0 {
                    if let Some((off, n_dim)) = self.layout.vector_comps {
                        self.plan.transforms[t_idx].apply_vector(&mut dst[off..off + n_dim], n_dim);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use std::thread;

    /// Two ranks, each owning two entities and holding two halos mirroring
    /// the peer's owned entities. Scalar halo entries must equal the owner's
    /// source entries exactly after the round trip.
    #[test]
    fn halo_roundtrip_two_ranks() {
        let comms = LocalComm::cluster(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let me = comm.rank();
                    let peer = 1 - me;
                    let mut plan = ExchangePlan::empty();
                    plan.ranks_send = vec![peer];
                    plan.ranks_recv = vec![peer];
                    plan.entities_send = vec![vec![0, 1]];
                    plan.entities_recv = vec![vec![2, 3]];
                    plan.transform_recv = vec![vec![0, 0]];

                    // Entities 0,1 owned; 2,3 halos. Stride 2.
                    #[allow(clippy::cast_precision_loss)]
                    let base = 10.0 * (me as Scalar + 1.0);
                    let mut field = vec![base, base + 1.0, base + 2.0, base + 3.0, 0.0, 0.0, 0.0, 0.0];
                    let layout = FieldLayout::scalar(2);
                    let h = start_exchange(&comm, &plan, layout, &field, 7).unwrap();
                    h.wait(&comm, &mut field).unwrap();

                    #[allow(clippy::cast_precision_loss)]
                    let peer_base = 10.0 * (peer as Scalar + 1.0);
                    assert_eq!(&field[4..8], &[peer_base, peer_base + 1.0, peer_base + 2.0, peer_base + 3.0]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    /// Periodic vector payloads are rotated by the marker transform on unpack.
    #[test]
    fn periodic_vector_rotation_on_unpack() {
        let comm = LocalComm::solo();
        let mut plan = ExchangePlan::empty();
        plan.transforms.push(Transform::rotation_z(std::f64::consts::FRAC_PI_2));
        plan.ranks_send = vec![0];
        plan.ranks_recv = vec![0];
        plan.entities_send = vec![vec![0]];
        plan.entities_recv = vec![vec![1]];
        plan.transform_recv = vec![vec![1]];

        // One scalar then a 2-vector per record.
        let mut field = vec![5.0, 1.0, 0.0, /* halo */ 0.0, 0.0, 0.0];
        let layout = FieldLayout::with_vector(3, 1, 2);
        let h = start_exchange(&comm, &plan, layout, &field, 9).unwrap();
        h.wait(&comm, &mut field).unwrap();

        assert!((field[3] - 5.0).abs() < 1e-15);
        assert!(field[4].abs() < 1e-15, "x-component rotated away, got {}", field[4]);
        assert!((field[5] - 1.0).abs() < 1e-15, "y-component now carries the vector");
    }
}
