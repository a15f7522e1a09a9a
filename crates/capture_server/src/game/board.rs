//! Board state and the chain-reaction capture rules.
//!
//! A cell explodes once it holds more atoms than it has neighbours minus one,
//! pushing one atom into every orthogonal neighbour and claiming it for the
//! mover. Explosions cascade in waves until the board settles or no opponent
//! owns a cell anymore.

use super::Color;
use crate::error::GameError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Row/column coordinate on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub row: usize,
    pub col: usize,
}

impl Position {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

/// Preset board dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridSize {
    #[default]
    Small,
    Large,
}

impl GridSize {
    /// `(rows, cols)` for this preset.
    pub fn dimensions(self) -> (usize, usize) {
        match self {
            GridSize::Small => (6, 10),
            GridSize::Large => (10, 18),
        }
    }

    /// Parses the short query form (`s`/`l`) or the full name.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "s" | "small" => Some(GridSize::Small),
            "l" | "large" => Some(GridSize::Large),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub owner: Option<Color>,
    pub atoms: u32,
}

/// What a single placement did to the board.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Number of cells that exploded, across all waves.
    pub explosions: usize,
    /// Number of reaction waves.
    pub waves: usize,
}

/// Fixed-size grid of cells, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Board {
    rows: usize,
    cols: usize,
    cells: Vec<Cell>,
}

impl Board {
    /// Creates an empty board. Both dimensions are clamped to at least 2 so
    /// that every cell has a capacity of one or more.
    pub fn new(rows: usize, cols: usize) -> Self {
        let rows = rows.max(2);
        let cols = cols.max(2);
        Self {
            rows,
            cols,
            cells: vec![Cell::default(); rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn cell(&self, pos: Position) -> Option<&Cell> {
        self.index(pos).map(|idx| &self.cells[idx])
    }

    /// Atoms a cell can hold before it explodes.
    pub fn capacity(&self, pos: Position) -> u32 {
        let mut capacity = 3;
        if pos.row == 0 || pos.row == self.rows - 1 {
            capacity -= 1;
        }
        if pos.col == 0 || pos.col == self.cols - 1 {
            capacity -= 1;
        }
        capacity
    }

    /// Checks that `color` may place on `pos` without touching the board.
    pub fn validate(&self, color: Color, pos: Position) -> Result<(), GameError> {
        let cell = self.cell(pos).ok_or(GameError::OutOfBounds(pos))?;
        match cell.owner {
            Some(owner) if owner != color => Err(GameError::InvalidMove(pos)),
            _ => Ok(()),
        }
    }

    /// Places one atom for `color` on `pos` and resolves the chain reaction.
    ///
    /// The board is left untouched when the move is rejected.
    pub fn place(&mut self, color: Color, pos: Position) -> Result<Placement, GameError> {
        self.validate(color, pos)?;

        let idx = self.index(pos).ok_or(GameError::OutOfBounds(pos))?;
        let cell = &mut self.cells[idx];
        cell.atoms += 1;
        cell.owner = Some(color);

        let mut placement = Placement::default();
        if self.is_critical(pos) {
            self.react(color, pos, &mut placement);
        }
        Ok(placement)
    }

    /// Number of owned cells per color. Colors owning nothing are absent.
    pub fn cell_counts(&self) -> HashMap<Color, usize> {
        let mut counts = HashMap::new();
        for owner in self.cells.iter().filter_map(|cell| cell.owner) {
            *counts.entry(owner).or_insert(0) += 1;
        }
        counts
    }

    fn react(&mut self, color: Color, origin: Position, placement: &mut Placement) {
        let mut wave = vec![origin];

        while !wave.is_empty() {
            if !self.has_opponent_cells(color) {
                break;
            }
            placement.waves += 1;

            let mut touched: Vec<Position> = Vec::new();
            for pos in wave {
                placement.explosions += 1;
                for neighbour in self.neighbours(pos) {
                    self.move_atom(pos, neighbour, color);
                    if !touched.contains(&neighbour) {
                        touched.push(neighbour);
                    }
                }
            }

            wave = touched
                .into_iter()
                .filter(|pos| self.is_critical(*pos))
                .collect();
        }
    }

    fn move_atom(&mut self, from: Position, to: Position, color: Color) {
        if let Some(idx) = self.index(from) {
            let source = &mut self.cells[idx];
            source.atoms = source.atoms.saturating_sub(1);
            if source.atoms == 0 {
                source.owner = None;
            }
        }
        if let Some(idx) = self.index(to) {
            let target = &mut self.cells[idx];
            target.atoms += 1;
            target.owner = Some(color);
        }
    }

    fn is_critical(&self, pos: Position) -> bool {
        self.cell(pos)
            .map_or(false, |cell| cell.atoms > self.capacity(pos))
    }

    fn has_opponent_cells(&self, color: Color) -> bool {
        self.cells
            .iter()
            .any(|cell| matches!(cell.owner, Some(owner) if owner != color))
    }

    /// Orthogonal neighbours in up, down, left, right order.
    fn neighbours(&self, pos: Position) -> Vec<Position> {
        let mut out = Vec::with_capacity(4);
        if pos.row > 0 {
            out.push(Position::new(pos.row - 1, pos.col));
        }
        if pos.row + 1 < self.rows {
            out.push(Position::new(pos.row + 1, pos.col));
        }
        if pos.col > 0 {
            out.push(Position::new(pos.row, pos.col - 1));
        }
        if pos.col + 1 < self.cols {
            out.push(Position::new(pos.row, pos.col + 1));
        }
        out
    }

    fn index(&self, pos: Position) -> Option<usize> {
        (pos.row < self.rows && pos.col < self.cols).then(|| pos.row * self.cols + pos.col)
    }
}
