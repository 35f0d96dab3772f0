//! Assignment of cells to ranks.
//!
//! Cells are split into contiguous chunks of their linear index, each carrying roughly the same
//! number of particles. The cell ownership map only changes here and on resume.

use crate::comm::Communicator;
use crate::mesh::Mesh;
use crate::Error;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadBalanceReport {
    /// Whether a new ownership map was computed.
    pub repartitioned: bool,
    /// Number of cells that changed owner.
    pub moved_cells: usize,
    /// Largest rank load over the mean load before balancing.
    pub imbalance_before: f64,
    /// Largest rank load over the mean load after balancing.
    pub imbalance_after: f64,
}

/// Splits cells with the given weights into `nranks` contiguous chunks of similar total weight.
///
/// Cells are assigned by the position of their weight midpoint along the cumulative weight. If
/// all weights are zero, cells are split by count instead.
pub fn contiguous_partition(weights: &[f64], nranks: usize) -> Vec<usize> {
    let total: f64 = weights.iter().sum();
    if !(total > 0.0) {
        let n = weights.len().max(1);
        return (0..weights.len())
            .map(|c| (c * nranks / n).min(nranks - 1))
            .collect();
    }
    let mut cumulative = 0.0;
    weights
        .iter()
        .map(|&w| {
            let mid = cumulative + 0.5 * w;
            cumulative += w;
            ((mid / total * nranks as f64).floor() as usize).min(nranks - 1)
        })
        .collect()
}

/// Largest rank load over the mean rank load. Returns `1.0` for an empty mesh.
pub fn imbalance(weights: &[f64], ranks: &[usize], nranks: usize) -> f64 {
    let mut loads = vec![0.0; nranks];
    for (&w, &r) in weights.iter().zip(ranks.iter()) {
        loads[r] += w;
    }
    let total: f64 = loads.iter().sum();
    if !(total > 0.0) {
        return 1.0;
    }
    let max = loads.iter().cloned().fold(0.0, f64::max);
    max / (total / nranks as f64)
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LoadBalancer {
    tolerance: f64,
}

impl LoadBalancer {
    pub fn new(tolerance: f64) -> Self {
        LoadBalancer { tolerance }
    }

    /// Computes cell ownership from the global particle distribution.
    ///
    /// The initial decomposition always partitions. Later calls keep the current map as long as
    /// the imbalance is within tolerance. Particles left in cells now owned by another rank must
    /// be handed over with a halo transfer.
    pub fn decompose<const D: usize, C: Communicator>(
        &self,
        mesh: &mut Mesh<D>,
        comm: &C,
        initial: bool,
    ) -> Result<LoadBalanceReport, Error> {
        let nranks = comm.size();
        let mut weights = mesh.particle_counts_per_cell();
        comm.all_reduce_sum(&mut weights)?;

        let current = mesh.cell_ranks();
        let imbalance_before = imbalance(&weights, &current, nranks);
        let mut report = LoadBalanceReport {
            repartitioned: false,
            moved_cells: 0,
            imbalance_before,
            imbalance_after: imbalance_before,
        };

        if initial || imbalance_before > self.tolerance {
            let ranks = contiguous_partition(&weights, nranks);
            report.moved_cells = ranks
                .iter()
                .zip(current.iter())
                .filter(|(a, b)| a != b)
                .count();
            report.imbalance_after = imbalance(&weights, &ranks, nranks);
            report.repartitioned = true;
            mesh.set_cell_ranks(&ranks)?;
        }
        comm.barrier()?;

        if comm.is_root() {
            log::info!(
                "Load balance: {} cells moved, imbalance {:.3} -> {:.3}",
                report.moved_cells,
                report.imbalance_before,
                report.imbalance_after
            );
        }
        Ok(report)
    }
}

/// Restores a persisted cell ownership map instead of computing a fresh decomposition.
pub fn resume_domain_cell_ranks<const D: usize, C: Communicator>(
    mesh: &mut Mesh<D>,
    comm: &C,
    ranks: &[usize],
) -> Result<(), Error> {
    if let Some(&r) = ranks.iter().find(|&&r| r >= comm.size()) {
        return Err(Error::MeshInit {
            reason: format!("cell owned by rank {} out of {}", r, comm.size()),
        });
    }
    mesh.set_cell_ranks(ranks)?;
    comm.barrier()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::*;

    #[test]
    fn partition_is_contiguous_and_balanced() {
        let weights = vec![4.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0];
        let ranks = contiguous_partition(&weights, 2);
        assert_eq!(ranks, vec![0, 1, 1, 1, 1, 1, 1, 1]);
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(imbalance(&weights, &ranks, 2), 1.0);
        assert_relative_eq!(imbalance(&weights, &[0; 8], 2), 2.0);
    }

    #[test]
    fn empty_mesh_splits_by_count() {
        let weights = vec![0.0; 6];
        assert_eq!(contiguous_partition(&weights, 3), vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(contiguous_partition(&weights, 1), vec![0; 6]);
        assert_eq!(imbalance(&weights, &[0; 6], 3), 1.0);
    }

    #[test]
    fn more_ranks_than_cells() {
        let weights = vec![1.0, 1.0];
        let ranks = contiguous_partition(&weights, 4);
        assert_eq!(ranks, vec![1, 3]);
    }
}
