/// A background grid cell.
///
/// Cells are owned by the [`Mesh`](crate::mesh::Mesh) and refer to their corner nodes by index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    pub id: usize,
    pub nodes: Vec<usize>,
    /// Rank owning this cell and all particles inside it.
    pub rank: usize,
}

impl Cell {
    pub fn new(id: usize, nodes: Vec<usize>) -> Self {
        Cell { id, nodes, rank: 0 }
    }
}
