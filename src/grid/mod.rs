//! Square state grids
//!
//! Every simulated quantity lives in a power-of-two square grid of 4-channel
//! floats, one cell per entity in row-major order. Cells past the entity
//! count are filled with a sentinel so kernels never need a validity check.

pub mod builder;

pub use builder::{build_blank, build_from_scalars, build_from_vectors};

use glam::{Vec3, Vec4};

use crate::consts::NULL_COORD;

/// Square grid of `[f32; 4]` cells
#[derive(Debug, Clone, PartialEq)]
pub struct StateGrid {
    width: u32,
    cells: Vec<[f32; 4]>,
}

impl StateGrid {
    /// Grid of the given width with every cell set to `value`
    pub fn filled(width: u32, value: [f32; 4]) -> Self {
        let len = (width as usize) * (width as usize);
        Self {
            width,
            cells: vec![value; len],
        }
    }

    /// Wrap existing cells; `cells.len()` must be `width²`
    pub fn from_cells(width: u32, cells: Vec<[f32; 4]>) -> Option<Self> {
        if cells.len() != (width as usize) * (width as usize) {
            return None;
        }
        Some(Self { width, cells })
    }

    /// Rebuild a grid from a flat float buffer (readback output)
    pub fn from_flat(width: u32, data: &[f32]) -> Option<Self> {
        if data.len() != (width as usize) * (width as usize) * 4 {
            return None;
        }
        let cells = data
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();
        Some(Self { width, cells })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn cells(&self) -> &[[f32; 4]] {
        &self.cells
    }

    #[inline]
    pub fn cells_mut(&mut self) -> &mut [[f32; 4]] {
        &mut self.cells
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<Vec4> {
        self.cells.get(index).map(|c| Vec4::from_array(*c))
    }

    /// Raw bytes for device upload
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.cells)
    }

    /// Flat float view (x, y, z, w per cell)
    pub fn as_flat(&self) -> &[f32] {
        bytemuck::cast_slice(&self.cells)
    }

    /// Size in bytes of a grid with the given width
    #[inline]
    pub fn byte_len(width: u32) -> u64 {
        (width as u64) * (width as u64) * 16
    }
}

/// Static inputs and start states for one group, all the same width
#[derive(Debug, Clone)]
pub struct SourceGrids {
    pub initial_positions: StateGrid,
    pub initial_velocities: StateGrid,
    pub timings: StateGrid,
    pub end_timings: StateGrid,
    /// Nothing is in the scene until its timing passes
    pub positions: StateGrid,
    pub velocities: StateGrid,
    pub collisions: StateGrid,
}

impl SourceGrids {
    /// Grids for explicit host-side positions
    pub fn from_vectors(
        positions: &[Vec3],
        velocities: &[Vec3],
        timings: &[f32],
        end_timings: &[f32],
    ) -> Self {
        let initial_positions = build_from_vectors(positions, 1.0, NULL_COORD);
        Self::with_initial_positions(initial_positions, velocities, timings, end_timings)
    }

    /// Grids around an already-built initial position grid
    pub fn with_initial_positions(
        initial_positions: StateGrid,
        velocities: &[Vec3],
        timings: &[f32],
        end_timings: &[f32],
    ) -> Self {
        let n = timings.len();
        Self {
            initial_positions,
            initial_velocities: build_from_vectors(velocities, 1.0, 0.0),
            timings: build_from_scalars(timings, NULL_COORD),
            end_timings: build_from_scalars(end_timings, NULL_COORD),
            positions: build_blank(n, 1.0, NULL_COORD, NULL_COORD),
            velocities: build_blank(n, 0.0, 0.0, 0.0),
            collisions: build_blank(n, 0.0, 0.0, 0.0),
        }
    }

    pub fn width(&self) -> u32 {
        self.timings.width()
    }

    /// True when every grid shares one width
    pub fn is_consistent(&self) -> bool {
        let w = self.width();
        [
            &self.initial_positions,
            &self.initial_velocities,
            &self.end_timings,
            &self.positions,
            &self.velocities,
            &self.collisions,
        ]
        .iter()
        .all(|g| g.width() == w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_grids_share_width() {
        let positions = vec![Vec3::ONE; 20];
        let velocities = vec![Vec3::X; 20];
        let timings = vec![0.0; 20];
        let grids = SourceGrids::from_vectors(&positions, &velocities, &timings, &timings);
        assert_eq!(grids.width(), 8);
        assert!(grids.is_consistent());
        assert_eq!(grids.positions.cells()[0], [NULL_COORD, NULL_COORD, NULL_COORD, 1.0]);
        assert_eq!(grids.timings.cells()[19], [NULL_COORD, NULL_COORD, NULL_COORD, 0.0]);
        assert_eq!(grids.timings.cells()[20], [NULL_COORD; 4]);
    }

    #[test]
    fn test_from_cells_rejects_wrong_length() {
        assert!(StateGrid::from_cells(2, vec![[0.0; 4]; 3]).is_none());
        assert!(StateGrid::from_cells(2, vec![[0.0; 4]; 4]).is_some());
    }

    #[test]
    fn test_flat_round_trip() {
        let grid = StateGrid::filled(2, [1.0, 2.0, 3.0, 4.0]);
        let back = StateGrid::from_flat(2, grid.as_flat()).unwrap();
        assert_eq!(grid, back);
        assert_eq!(grid.as_bytes().len() as u64, StateGrid::byte_len(2));
    }
}
