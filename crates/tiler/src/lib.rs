//! Tile scheduling for the progressive renderer.
//!
//! The screen is divided into an `N x N` grid. Tiles are visited in a square
//! spiral starting near the centre, and each visited tile receives a fixed
//! number of accumulation samples before the spiral moves on. Everything in
//! this crate is plain arithmetic so it can be tested without a GPU.

use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum TilerError {
    #[error("tile grid must be at least 1x1")]
    EmptyGrid,
    #[error("sample count per tile must be at least 1")]
    NoSamples,
}

/// Grid cell visited by the spiral, in grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub col: i32,
    pub row: i32,
}

/// Rectangular sub-region of the screen in normalized `[0, 1]` coordinates,
/// handed to the trace shader to restrict ray generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tile {
    pub x0: f32,
    pub x1: f32,
    pub y0: f32,
    pub y1: f32,
}

impl Tile {
    /// Bounds of `cell` within an `grid x grid` subdivision of the screen.
    pub fn from_cell(cell: Cell, grid: u32) -> Self {
        let n = grid as f32;
        Self {
            x0: cell.col as f32 / n,
            x1: (cell.col + 1) as f32 / n,
            y0: cell.row as f32 / n,
            y1: (cell.row + 1) as f32 / n,
        }
    }

    /// The same bounds scaled to pixel coordinates, `[x0, x1, y0, y1]`.
    pub fn to_pixels(self, width: u32, height: u32) -> [f32; 4] {
        [
            self.x0 * width as f32,
            self.x1 * width as f32,
            self.y0 * height as f32,
            self.y1 * height as f32,
        ]
    }
}

/// Square-spiral (Ulam-style) traversal over an `grid x grid` cell grid.
///
/// Starts at `col = (grid - 1) / 2, row = grid / 2` heading up, rotating 90
/// degrees after each leg and lengthening the leg after every horizontal one.
/// Iteration halts the first time a coordinate leaves `[0, grid)` in either
/// axis, so for some grid sizes the outermost cells are never visited. That
/// matches the long-standing traversal order of this harness and callers rely
/// on it staying put.
#[derive(Debug, Clone)]
pub struct SpiralTiles {
    grid: i32,
    col: i32,
    row: i32,
    dir_col: i32,
    dir_row: i32,
    step: i32,
    stepsize: i32,
}

impl SpiralTiles {
    pub fn new(grid: u32) -> Result<Self, TilerError> {
        if grid == 0 {
            return Err(TilerError::EmptyGrid);
        }
        let grid = grid as i32;
        Ok(Self {
            grid,
            col: (grid - 1) / 2,
            row: grid / 2,
            dir_col: 0,
            dir_row: -1,
            step: 0,
            stepsize: 1,
        })
    }
}

impl Iterator for SpiralTiles {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        let in_bounds = (0..self.grid).contains(&self.col) && (0..self.grid).contains(&self.row);
        if !in_bounds {
            return None;
        }
        let cell = Cell {
            col: self.col,
            row: self.row,
        };

        self.col += self.dir_col;
        self.row += self.dir_row;
        self.step += 1;
        if self.step == self.stepsize {
            // A finished horizontal leg lengthens the next pair of legs.
            if self.dir_row == 0 {
                self.stepsize += 1;
            }
            let next_col = -self.dir_row;
            self.dir_row = self.dir_col;
            self.dir_col = next_col;
            self.step = 0;
        }

        Some(cell)
    }
}

/// One accumulation draw: a tile plus the sample index within that tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    pub cell: Cell,
    pub tile: Tile,
    /// Monotonic per-tile counter in `[0, samples)`, reset for every tile.
    pub sample: u32,
}

/// Flattens a spiral traversal into `(tile, sample)` steps, `samples` draws
/// per visited tile.
#[derive(Debug, Clone)]
pub struct SamplePlan {
    spiral: SpiralTiles,
    grid: u32,
    samples: u32,
    current: Option<Cell>,
    sample: u32,
}

impl SamplePlan {
    pub fn new(grid: u32, samples: u32) -> Result<Self, TilerError> {
        if samples == 0 {
            return Err(TilerError::NoSamples);
        }
        let mut spiral = SpiralTiles::new(grid)?;
        let current = spiral.next();
        Ok(Self {
            spiral,
            grid,
            samples,
            current,
            sample: 0,
        })
    }

    pub fn samples_per_tile(&self) -> u32 {
        self.samples
    }
}

impl Iterator for SamplePlan {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        let cell = self.current?;
        let step = Step {
            cell,
            tile: Tile::from_cell(cell, self.grid),
            sample: self.sample,
        };

        self.sample += 1;
        if self.sample == self.samples {
            self.sample = 0;
            self.current = self.spiral.next();
        }

        Some(step)
    }
}

/// Wall-clock limiter for the display/present pass.
///
/// Accumulation runs as fast as the GPU allows; the visible window is only
/// refreshed when at least `interval` has elapsed since the previous grant.
/// Denied opportunities are dropped, never queued, so a fast accumulator can
/// not build up a backlog of presents.
#[derive(Debug, Clone)]
pub struct DisplayThrottle {
    interval: Duration,
    last: Instant,
}

impl DisplayThrottle {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last: now }
    }

    /// Conventional ~60 Hz refresh limit.
    pub fn sixty_hz(now: Instant) -> Self {
        Self::new(Duration::from_secs(1) / 60, now)
    }

    /// Returns true and arms the next interval if a display is due.
    pub fn ready(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }

    /// Restarts the interval, e.g. after a resize discarded the accumulation.
    pub fn rearm(&mut self, now: Instant) {
        self.last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spiral_starts_at_centre_for_five() {
        let mut spiral = SpiralTiles::new(5).unwrap();
        assert_eq!(spiral.next(), Some(Cell { col: 2, row: 2 }));
    }

    #[test]
    fn spiral_moves_one_axis_per_step() {
        let cells: Vec<Cell> = SpiralTiles::new(5).unwrap().collect();
        for pair in cells.windows(2) {
            let dc = (pair[1].col - pair[0].col).abs();
            let dr = (pair[1].row - pair[0].row).abs();
            assert_eq!(dc + dr, 1, "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn spiral_stays_in_bounds_and_never_repeats() {
        for grid in 1..=9u32 {
            let cells: Vec<Cell> = SpiralTiles::new(grid).unwrap().collect();
            assert!(!cells.is_empty());
            for (i, cell) in cells.iter().enumerate() {
                assert!((0..grid as i32).contains(&cell.col));
                assert!((0..grid as i32).contains(&cell.row));
                assert!(!cells[..i].contains(cell), "repeated {cell:?}");
            }
        }
    }

    #[test]
    fn spiral_halts_on_first_escape() {
        // For a 2x2 grid the start is (0, 1) heading up. The walk ends the
        // first time a coordinate leaves the grid and never resumes; the
        // visited count is pinned so a silent rework of the traversal (for
        // example one that guarantees full coverage for every grid size)
        // shows up here.
        let cells: Vec<Cell> = SpiralTiles::new(2).unwrap().collect();
        assert_eq!(cells.first(), Some(&Cell { col: 0, row: 1 }));
        assert_eq!(cells.len(), 4);
    }

    #[test]
    fn spiral_known_prefix_for_five() {
        let cells: Vec<Cell> = SpiralTiles::new(5).unwrap().take(6).collect();
        assert_eq!(
            cells,
            vec![
                Cell { col: 2, row: 2 },
                Cell { col: 2, row: 1 },
                Cell { col: 3, row: 1 },
                Cell { col: 3, row: 2 },
                Cell { col: 3, row: 3 },
                Cell { col: 2, row: 3 },
            ]
        );
    }

    #[test]
    fn empty_grid_is_rejected() {
        assert!(matches!(SpiralTiles::new(0), Err(TilerError::EmptyGrid)));
        assert!(matches!(SamplePlan::new(0, 4), Err(TilerError::EmptyGrid)));
        assert!(matches!(SamplePlan::new(5, 0), Err(TilerError::NoSamples)));
    }

    #[test]
    fn plan_emits_samples_per_tile_and_resets_counter() {
        let samples = 3;
        let steps: Vec<Step> = SamplePlan::new(5, samples).unwrap().collect();
        let tiles = SpiralTiles::new(5).unwrap().count();
        assert_eq!(steps.len(), tiles * samples as usize);

        for chunk in steps.chunks(samples as usize) {
            let cell = chunk[0].cell;
            for (i, step) in chunk.iter().enumerate() {
                assert_eq!(step.cell, cell, "tile changed mid-sequence");
                assert_eq!(step.sample, i as u32);
            }
        }
    }

    #[test]
    fn tile_bounds_cover_unit_interval() {
        let tile = Tile::from_cell(Cell { col: 0, row: 4 }, 5);
        assert_eq!(tile.x0, 0.0);
        assert!((tile.x1 - 0.2).abs() < 1e-6);
        assert!((tile.y0 - 0.8).abs() < 1e-6);
        assert_eq!(tile.y1, 1.0);

        let px = tile.to_pixels(1000, 500);
        assert_eq!(px[0], 0.0);
        assert!((px[1] - 200.0).abs() < 1e-3);
        assert!((px[2] - 400.0).abs() < 1e-3);
        assert_eq!(px[3], 500.0);
    }

    #[test]
    fn throttle_denies_within_interval() {
        let t0 = Instant::now();
        let mut throttle = DisplayThrottle::new(Duration::from_millis(16), t0);
        assert!(!throttle.ready(t0));
        assert!(!throttle.ready(t0 + Duration::from_millis(10)));
        assert!(throttle.ready(t0 + Duration::from_millis(16)));
        // The grant re-arms the interval from the granted instant.
        assert!(!throttle.ready(t0 + Duration::from_millis(24)));
        assert!(throttle.ready(t0 + Duration::from_millis(33)));
    }

    #[test]
    fn throttle_rearm_restarts_interval() {
        let t0 = Instant::now();
        let mut throttle = DisplayThrottle::new(Duration::from_millis(16), t0);
        assert!(throttle.ready(t0 + Duration::from_millis(20)));
        throttle.rearm(t0 + Duration::from_millis(30));
        assert!(!throttle.ready(t0 + Duration::from_millis(40)));
        assert!(throttle.ready(t0 + Duration::from_millis(46)));
    }
}
