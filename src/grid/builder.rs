//! Buffer builder: host arrays to sentinel-padded square grids
//!
//! Cells `[0, n)` receive the supplied (or active) values, cells
//! `[n, width²)` receive the sentinel. Output depends only on the input, so
//! identical input produces bit-identical grids.

use glam::Vec3;

use super::StateGrid;
use crate::grid_width;

/// Vectors in xyz, `fill_channel` in w; padding cells are `(sentinel, sentinel, sentinel, fill_channel)`
pub fn build_from_vectors(values: &[Vec3], fill_channel: f32, sentinel: f32) -> StateGrid {
    let width = grid_width(values.len());
    let mut grid = StateGrid::filled(width, [sentinel, sentinel, sentinel, fill_channel]);
    for (cell, v) in grid.cells_mut().iter_mut().zip(values) {
        *cell = [v.x, v.y, v.z, fill_channel];
    }
    grid
}

/// Scalars in w with the sentinel in xyz; padding cells are the sentinel in every channel
pub fn build_from_scalars(values: &[f32], sentinel: f32) -> StateGrid {
    let width = grid_width(values.len());
    let mut grid = StateGrid::filled(width, [sentinel; 4]);
    for (cell, &v) in grid.cells_mut().iter_mut().zip(values) {
        *cell = [sentinel, sentinel, sentinel, v];
    }
    grid
}

/// Grid sized for `n` entities: active cells `(active_fill ×3, fill_channel)`,
/// padding cells `(inactive_fill ×3, fill_channel)`
pub fn build_blank(n: usize, fill_channel: f32, active_fill: f32, inactive_fill: f32) -> StateGrid {
    let width = grid_width(n);
    let mut grid = StateGrid::filled(
        width,
        [inactive_fill, inactive_fill, inactive_fill, fill_channel],
    );
    for cell in grid.cells_mut().iter_mut().take(n) {
        *cell = [active_fill, active_fill, active_fill, fill_channel];
    }
    grid
}
