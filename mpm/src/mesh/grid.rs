use crate::mesh::particle::ShapeData;
use crate::params::{to_vector, ConfigError, GridConfig};
use crate::Vector;

/// Structured Cartesian background grid.
///
/// Cells and nodes are numbered lexicographically with the first axis varying fastest. Each cell
/// has `2^D` corner nodes; corner `a` is offset by one node along axis `i` if bit `i` of `a` is
/// set.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid<const D: usize> {
    origin: Vector<D>,
    spacing: Vector<D>,
    cells: [usize; D],
}

impl<const D: usize> Grid<D> {
    pub fn new(origin: Vector<D>, spacing: Vector<D>, cells: [usize; D]) -> Self {
        Grid {
            origin,
            spacing,
            cells,
        }
    }

    pub fn from_config(config: &GridConfig) -> Result<Self, ConfigError> {
        let origin = to_vector::<D>(&config.origin, "mesh.origin")?;
        let spacing = to_vector::<D>(&config.spacing, "mesh.spacing")?;
        if config.cells.len() != D {
            return Err(ConfigError::Dimension {
                name: String::from("mesh.cells"),
                expected: D,
                found: config.cells.len(),
            });
        }
        if spacing.iter().any(|&h| !(h > 0.0)) {
            return Err(ConfigError::NonPositive {
                name: String::from("mesh.spacing"),
            });
        }
        let mut cells = [0; D];
        cells.copy_from_slice(&config.cells);
        if cells.iter().any(|&n| n == 0) {
            return Err(ConfigError::NonPositive {
                name: String::from("mesh.cells"),
            });
        }
        Ok(Grid::new(origin, spacing, cells))
    }

    pub fn spacing(&self) -> &Vector<D> {
        &self.spacing
    }

    pub fn min_corner(&self) -> Vector<D> {
        self.origin
    }

    pub fn max_corner(&self) -> Vector<D> {
        let mut max = self.origin;
        for i in 0..D {
            max[i] += self.spacing[i] * self.cells[i] as f64;
        }
        max
    }

    pub fn num_cells(&self) -> usize {
        self.cells.iter().product()
    }

    pub fn num_nodes(&self) -> usize {
        self.cells.iter().map(|&n| n + 1).product()
    }

    pub const fn nodes_per_cell() -> usize {
        1 << D
    }

    fn cell_multi_index(&self, mut cell: usize) -> [usize; D] {
        let mut idx = [0; D];
        for i in 0..D {
            idx[i] = cell % self.cells[i];
            cell /= self.cells[i];
        }
        idx
    }

    fn node_linear_index(&self, idx: &[usize; D]) -> usize {
        let mut linear = 0;
        let mut stride = 1;
        for i in 0..D {
            linear += idx[i] * stride;
            stride *= self.cells[i] + 1;
        }
        linear
    }

    pub fn node_position(&self, mut node: usize) -> Vector<D> {
        let mut pos = self.origin;
        for i in 0..D {
            let n = self.cells[i] + 1;
            pos[i] += (node % n) as f64 * self.spacing[i];
            node /= n;
        }
        pos
    }

    /// Corner node indices of the given cell.
    pub fn cell_nodes(&self, cell: usize) -> Vec<usize> {
        let base = self.cell_multi_index(cell);
        (0..Self::nodes_per_cell())
            .map(|a| {
                let mut idx = base;
                for (i, v) in idx.iter_mut().enumerate() {
                    *v += (a >> i) & 1;
                }
                self.node_linear_index(&idx)
            })
            .collect()
    }

    fn cell_min_corner(&self, cell: usize) -> Vector<D> {
        let idx = self.cell_multi_index(cell);
        let mut min = self.origin;
        for i in 0..D {
            min[i] += idx[i] as f64 * self.spacing[i];
        }
        min
    }

    /// Checks whether the given point lies inside the (closed) grid domain.
    pub fn contains(&self, pos: &Vector<D>) -> bool {
        self.locate(pos).is_some()
    }

    /// Finds the cell containing the given point.
    ///
    /// Points on the upper boundary of the domain belong to the last cell along that axis.
    pub fn locate(&self, pos: &Vector<D>) -> Option<usize> {
        let mut cell = 0;
        let mut stride = 1;
        for i in 0..D {
            let t = (pos[i] - self.origin[i]) / self.spacing[i];
            if !t.is_finite() || t < 0.0 || t > self.cells[i] as f64 {
                return None;
            }
            let idx = (t.floor() as usize).min(self.cells[i] - 1);
            cell += idx * stride;
            stride *= self.cells[i];
        }
        Some(cell)
    }

    /// Projects the given point onto the interior of the domain.
    pub fn clamp_inside(&self, pos: &Vector<D>) -> Vector<D> {
        let min = self.min_corner();
        let max = self.max_corner();
        let mut clamped = *pos;
        for i in 0..D {
            let eps = 1e-9 * self.spacing[i];
            let x = if pos[i].is_finite() { pos[i] } else { min[i] };
            clamped[i] = x.max(min[i] + eps).min(max[i] - eps);
        }
        clamped
    }

    /// Natural coordinates in `[-1, 1]^D` of a point with respect to the given cell.
    pub fn natural_coordinates(&self, cell: usize, pos: &Vector<D>) -> Vector<D> {
        let min = self.cell_min_corner(cell);
        let mut xi = Vector::<D>::zeros();
        for i in 0..D {
            xi[i] = 2.0 * (pos[i] - min[i]) / self.spacing[i] - 1.0;
        }
        xi
    }

    /// Multilinear shape function values and physical gradients at `pos` inside `cell`.
    pub fn shape_data(&self, cell: usize, pos: &Vector<D>) -> ShapeData<D> {
        let xi = self.natural_coordinates(cell, pos);
        let nodes = self.cell_nodes(cell);
        let mut weights = Vec::with_capacity(nodes.len());
        let mut gradients = Vec::with_capacity(nodes.len());
        for a in 0..nodes.len() {
            let sign = |i: usize| if (a >> i) & 1 == 1 { 1.0 } else { -1.0 };
            let factors: [f64; D] = std::array::from_fn(|i| 0.5 * (1.0 + sign(i) * xi[i]));
            weights.push(factors.iter().product());
            let mut grad = Vector::<D>::zeros();
            for i in 0..D {
                let others: f64 = (0..D).filter(|&j| j != i).map(|j| factors[j]).product();
                grad[i] = sign(i) / self.spacing[i] * others;
            }
            gradients.push(grad);
        }
        ShapeData {
            nodes,
            weights,
            gradients,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::*;

    fn grid2() -> Grid<2> {
        Grid::new(Vector::<2>::zeros(), Vector::<2>::new(0.5, 1.0), [4, 2])
    }

    #[test]
    fn counts() {
        let grid = grid2();
        assert_eq!(grid.num_cells(), 8);
        assert_eq!(grid.num_nodes(), 15);
        assert_eq!(Grid::<2>::nodes_per_cell(), 4);
        assert_eq!(grid.cell_nodes(0), vec![0, 1, 5, 6]);
        assert_eq!(grid.cell_nodes(5), vec![6, 7, 11, 12]);
    }

    #[test]
    fn locate() {
        let grid = grid2();
        assert_eq!(grid.locate(&Vector::<2>::new(0.1, 0.1)), Some(0));
        assert_eq!(grid.locate(&Vector::<2>::new(0.6, 1.5)), Some(5));
        // Upper boundary belongs to the last cell.
        assert_eq!(grid.locate(&Vector::<2>::new(2.0, 2.0)), Some(7));
        assert_eq!(grid.locate(&Vector::<2>::new(-0.1, 0.5)), None);
        assert_eq!(grid.locate(&Vector::<2>::new(0.1, f64::NAN)), None);
        let clamped = grid.clamp_inside(&Vector::<2>::new(3.0, -1.0));
        assert!(grid.contains(&clamped));
    }

    #[test]
    fn partition_of_unity() {
        let grid = Grid::<3>::new(Vector::<3>::zeros(), Vector::<3>::repeat(0.25), [2, 2, 2]);
        let pos = Vector::<3>::new(0.3, 0.1, 0.45);
        let cell = grid.locate(&pos).unwrap();
        let shape = grid.shape_data(cell, &pos);
        assert_relative_eq!(shape.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-14);
        let grad_sum = shape
            .gradients
            .iter()
            .fold(Vector::<3>::zeros(), |acc, g| acc + g);
        assert_relative_eq!(grad_sum.norm(), 0.0, epsilon = 1e-12);

        // Linear completeness: sum N_a x_a == x.
        let x = shape
            .nodes
            .iter()
            .zip(shape.weights.iter())
            .fold(Vector::<3>::zeros(), |acc, (&n, &w)| {
                acc + grid.node_position(n) * w
            });
        assert_relative_eq!(x, pos, epsilon = 1e-14);
    }
}
