//! Hand-over of particles that moved into cells owned by other ranks.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::comm::Communicator;
use crate::mesh::{Mesh, Particle};
use crate::Error;

/// Outcome of a halo transfer on a single rank.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HaloReport {
    pub sent: usize,
    pub received: usize,
    /// No rank had particles to send, so no exchange took place.
    pub skipped: bool,
}

/// Sends every particle located in a cell owned by another rank to that rank, and adopts the
/// particles sent to this rank.
///
/// Sent particles are removed from this rank only once all receivers acknowledged them. On a
/// communication failure they are restored before the error is returned.
pub fn transfer_halo_particles<const D: usize, C: Communicator>(
    mesh: &mut Mesh<D>,
    comm: &C,
) -> Result<HaloReport, Error> {
    let rank = comm.rank();
    let outgoing = mesh
        .particles()
        .iter()
        .filter(|p| mesh.destination(p).map_or(false, |r| r != rank))
        .count();
    let mut total = [outgoing as f64];
    comm.all_reduce_sum(&mut total)?;
    if total[0] == 0.0 {
        comm.barrier()?;
        return Ok(HaloReport {
            skipped: true,
            ..Default::default()
        });
    }

    let foreign = mesh.take_foreign_particles();
    let buffers = match pack(mesh, &foreign, comm.size()) {
        Ok(buffers) => buffers,
        Err(e) => {
            mesh.append_particles(foreign);
            return Err(e);
        }
    };
    let incoming = match comm.exchange(buffers) {
        Ok(incoming) => incoming,
        Err(e) => {
            log::error!(
                "Halo exchange failed on rank {}; keeping {} particles",
                rank,
                foreign.len()
            );
            mesh.append_particles(foreign);
            return Err(e.into());
        }
    };

    let mut received = Vec::new();
    for buf in incoming.iter().filter(|b| !b.is_empty()) {
        let particles: Vec<Particle<D>> = bincode::deserialize(buf)?;
        received.extend(particles);
    }
    let grid = mesh.grid();
    for p in received.iter_mut() {
        p.cell = grid.locate(&p.position);
        if p.cell.is_none() {
            return Err(Error::ParticleOutsideDomain {
                id: p.id,
                position: p.position.iter().cloned().collect(),
            });
        }
    }
    let report = HaloReport {
        sent: foreign.len(),
        received: received.len(),
        skipped: false,
    };
    mesh.append_particles(received);
    comm.barrier()?;
    log::debug!(
        "Rank {} sent {} and received {} halo particles",
        rank,
        report.sent,
        report.received
    );
    Ok(report)
}

fn pack<const D: usize>(
    mesh: &Mesh<D>,
    particles: &[Particle<D>],
    size: usize,
) -> Result<Vec<Vec<u8>>, Error> {
    let mut per_rank: Vec<Vec<&Particle<D>>> = vec![Vec::new(); size];
    for p in particles.iter() {
        match mesh.destination(p) {
            Some(dst) if dst < size => per_rank[dst].push(p),
            _ => {
                return Err(Error::MeshInit {
                    reason: format!("particle {} has no valid owning rank", p.id),
                })
            }
        }
    }
    per_rank
        .iter()
        .map(|ps| {
            if ps.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(bincode::serialize(ps)?)
            }
        })
        .collect()
}

/// Gathers a value from every other rank, in rank order.
pub fn all_gather<T, C>(comm: &C, value: &T) -> Result<Vec<T>, Error>
where
    T: Serialize + DeserializeOwned,
    C: Communicator,
{
    if comm.size() == 1 {
        return Ok(Vec::new());
    }
    let buf = bincode::serialize(value)?;
    let incoming = comm.exchange(vec![buf; comm.size()])?;
    incoming
        .iter()
        .map(|b| bincode::deserialize(b).map_err(Error::from))
        .collect()
}
