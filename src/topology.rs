//! The static shape of the icosahedral grid.
//!
//! At resolution `r` the sphere is cut into 5 charts, each a parallelogram
//! strip of four icosahedron faces stored as an `H x W` array with
//! `H = 2^r` and `W = 2H`. Rows run along the lattice direction `a` and
//! columns along `b`, so the six ring neighbors of a cell sit at offsets
//! `(0,1) (1,1) (1,0) (0,-1) (-1,-1) (-1,0)` and `(-1,1)`, `(1,-1)` are not
//! neighbors at all.
//!
//! The closure of chart `k` is `[0,H] x [0,W]`. Its corners are the upper
//! icosahedron vertex `U_k` at `(0,0)`, the north pole at `(H,0)`, the south
//! pole at `(0,W)` and `L_{k+1}` at `(H,W)`; `L_k` is stored at `(0,H)`.
//! Only the two poles are not stored in any chart, giving `5*H*W + 2`
//! vertices in total.
//!
//! Every chart has six seam edges. Each one is a [LatticeMap] taking a
//! position just outside the chart to the same point expressed in the
//! neighbor chart's lattice, together with the number of sixth-turns the
//! local frame rotates by on the way.

use crate::error::IcoError;

/// Number of charts, fixed for every resolution.
pub const CHARTS: usize = 5;

/// Number of ring neighbors around a vertex, and the size of the rotation
/// group acting on them.
pub const RING: usize = 6;

/// Largest accepted resolution. At this size a single channel already
/// holds over ten million cells.
pub const MAX_RESOLUTION: i64 = 10;

const MAX_HOPS: usize = 4;

/// Names the six border pieces of a chart that can be crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Row `-1`, columns `[0,H)`
    Row0Head,
    /// Row `-1`, columns `[H,W)`
    Row0Tail,
    /// Column `-1`
    Col0,
    /// Row `H`, columns `[0,H)`
    RowHHead,
    /// Row `H`, columns `[H,W)`
    RowHTail,
    /// Column `W`
    ColW,
}

impl Side {
    /// All sides, in the order they are stored in a chart's seam table.
    pub const ALL: [Side; 6] = [
        Side::Row0Head,
        Side::Row0Tail,
        Side::Col0,
        Side::RowHHead,
        Side::RowHTail,
        Side::ColW,
    ];

    fn index(self) -> usize {
        match self {
            Side::Row0Head => 0,
            Side::Row0Tail => 1,
            Side::Col0 => 2,
            Side::RowHHead => 3,
            Side::RowHTail => 4,
            Side::ColW => 5,
        }
    }
}

/// A lattice isometry: rotate by `rotation` sixth-turns, then translate.
///
/// One sixth-turn takes `(i, j)` to `(j, j - i)`, which carries every ring
/// offset to the next one in slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatticeMap {
    /// Sixth-turns, in `0..6`
    pub rotation: u8,
    /// Translation applied after rotating
    pub offset: (isize, isize),
}

impl LatticeMap {
    /// Map a lattice position.
    pub fn apply(&self, row: isize, col: isize) -> (isize, isize) {
        let (i, j) = rotate(row, col, self.rotation);
        (i + self.offset.0, j + self.offset.1)
    }
}

/// Rotates a lattice vector by `steps` sixth-turns.
pub fn rotate(row: isize, col: isize, steps: u8) -> (isize, isize) {
    let (mut i, mut j) = (row, col);
    for _ in 0..steps % RING as u8 {
        (i, j) = (j, j - i);
    }
    (i, j)
}

/// One record of the chart seam table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeamEdge {
    /// Which border piece this record describes
    pub side: Side,
    /// The chart on the other side
    pub neighbor: usize,
    /// Where positions past `side` land in `neighbor`
    pub map: LatticeMap,
}

/// The two icosahedron vertices that no chart stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pole {
    /// Shared by the rows `H` of every chart
    North,
    /// Shared by the rows `0` of every chart
    South,
}

/// A stored grid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cell {
    /// Chart index in `0..5`
    pub chart: usize,
    /// Row in `0..H`
    pub row: usize,
    /// Column in `0..W`
    pub col: usize,
}

/// Either a stored cell or one of the poles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Site {
    /// A stored cell
    Cell(Cell),
    /// An unstored pole
    Pole(Pole),
}

/// Where a lattice position really lives, and how far the local frame
/// turned while getting there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// The vertex
    pub site: Site,
    /// Accumulated frame rotation in sixth-turns, `0..6`
    pub shift: u8,
}

/// The grid at one resolution, with its fixed seam table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridTopology {
    resolution: u32,
    size: usize,
    seams: [[SeamEdge; 6]; CHARTS],
}

impl GridTopology {
    /// Builds the grid for `resolution`. Negative or oversized
    /// resolutions are a [IcoError::Configuration].
    pub fn new(resolution: i64) -> Result<Self, IcoError> {
        if !(0..=MAX_RESOLUTION).contains(&resolution) {
            return Err(IcoError::Configuration(format!(
                "resolution must lie in 0..={}, got {}",
                MAX_RESOLUTION, resolution
            )));
        }
        let resolution = resolution as u32;
        let size = 1usize << resolution;
        let n = size as isize;

        let seams = std::array::from_fn(|chart| {
            let prev = (chart + CHARTS - 1) % CHARTS;
            let next = (chart + 1) % CHARTS;
            let edge = |side, neighbor, rotation, offset| SeamEdge {
                side,
                neighbor,
                map: LatticeMap { rotation, offset },
            };
            [
                edge(Side::Row0Head, prev, 0, (n, n)),
                edge(Side::Row0Tail, prev, 5, (2 * n, 2 * n)),
                edge(Side::Col0, prev, 1, (n, n)),
                edge(Side::RowHHead, next, 5, (0, -n)),
                edge(Side::RowHTail, next, 0, (-n, -n)),
                edge(Side::ColW, next, 1, (-2 * n, 0)),
            ]
        });

        Ok(GridTopology {
            resolution,
            size,
            seams,
        })
    }

    /// The subdivision level this grid was built for.
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Chart height `H`.
    pub fn height(&self) -> usize {
        self.size
    }

    /// Chart width `W = 2H`.
    pub fn width(&self) -> usize {
        2 * self.size
    }

    /// Number of stored cells over all charts.
    pub fn stored_cells(&self) -> usize {
        CHARTS * self.height() * self.width()
    }

    /// True vertex count `10 H^2 + 2`.
    pub fn vertex_count(&self) -> usize {
        self.stored_cells() + 2
    }

    /// The seam table of one chart.
    pub fn seams(&self, chart: usize) -> &[SeamEdge; 6] {
        &self.seams[chart]
    }

    /// A single seam record.
    pub fn seam(&self, chart: usize, side: Side) -> &SeamEdge {
        &self.seams[chart][side.index()]
    }

    /// Which border piece a position outside the stored array falls on,
    /// or `None` when it is stored.
    pub fn side_of(&self, row: isize, col: isize) -> Option<Side> {
        let n = self.size as isize;
        if row < 0 {
            Some(if col < n { Side::Row0Head } else { Side::Row0Tail })
        } else if col < 0 {
            Some(Side::Col0)
        } else if row >= n {
            Some(if col < n { Side::RowHHead } else { Side::RowHTail })
        } else if col >= 2 * n {
            Some(Side::ColW)
        } else {
            None
        }
    }

    /// Finds the vertex at a lattice position of `chart`. Valid for every
    /// position within one ring of the stored array.
    pub fn resolve(&self, chart: usize, row: isize, col: isize) -> Result<Resolved, IcoError> {
        self.walk(chart, row, col, None)
    }

    /// Like [GridTopology::resolve], but crosses `first` before anything
    /// else. Positions next to a cone vertex reach different copies of
    /// their source depending on which seam is crossed first.
    pub fn resolve_through(
        &self,
        chart: usize,
        row: isize,
        col: isize,
        first: Side,
    ) -> Result<Resolved, IcoError> {
        self.walk(chart, row, col, Some(first))
    }

    fn walk(
        &self,
        mut chart: usize,
        mut row: isize,
        mut col: isize,
        mut forced: Option<Side>,
    ) -> Result<Resolved, IcoError> {
        let n = self.size as isize;
        let mut shift = 0u8;

        for _ in 0..=MAX_HOPS {
            let side = match forced.take() {
                Some(side) => Some(side),
                None => {
                    if (row, col) == (n, 0) {
                        return Ok(Resolved {
                            site: Site::Pole(Pole::North),
                            shift,
                        });
                    }
                    if (row, col) == (0, 2 * n) {
                        return Ok(Resolved {
                            site: Site::Pole(Pole::South),
                            shift,
                        });
                    }
                    self.side_of(row, col)
                }
            };

            match side {
                None => {
                    return Ok(Resolved {
                        site: Site::Cell(Cell {
                            chart,
                            row: row as usize,
                            col: col as usize,
                        }),
                        shift,
                    })
                }
                Some(side) => {
                    let seam = self.seam(chart, side);
                    (row, col) = seam.map.apply(row, col);
                    chart = seam.neighbor;
                    shift = (shift + seam.map.rotation) % RING as u8;
                }
            }
        }

        Err(IcoError::topology(format!(
            "position ({}, {}) of chart {} did not settle after {} seam crossings",
            row, col, chart, MAX_HOPS
        )))
    }

    /// Global id of a stored cell: `(chart * H + row) * W + col`.
    pub fn cell_id(&self, cell: Cell) -> usize {
        (cell.chart * self.height() + cell.row) * self.width() + cell.col
    }

    /// Global id of a pole, placed after every stored cell.
    pub fn pole_id(&self, pole: Pole) -> usize {
        match pole {
            Pole::North => self.stored_cells(),
            Pole::South => self.stored_cells() + 1,
        }
    }

    /// Global id of any vertex.
    pub fn site_id(&self, site: Site) -> usize {
        match site {
            Site::Cell(cell) => self.cell_id(cell),
            Site::Pole(pole) => self.pole_id(pole),
        }
    }

    /// Inverse of [GridTopology::cell_id].
    pub fn cell_of(&self, id: usize) -> Option<Cell> {
        if id >= self.stored_cells() {
            return None;
        }
        let (w, h) = (self.width(), self.height());
        Some(Cell {
            chart: id / (h * w),
            row: (id / w) % h,
            col: id % w,
        })
    }

    /// The ten stored degree-5 vertices: `U_k` at `(0,0)` and `L_k` at
    /// `(0,H)` of every chart.
    pub fn cone_cells(&self) -> Vec<Cell> {
        (0..CHARTS)
            .flat_map(|chart| {
                [0, self.height()].map(|col| Cell { chart, row: 0, col })
            })
            .collect()
    }

    /// Iterates over every stored cell in global id order.
    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (0..self.stored_cells()).filter_map(|id| self.cell_of(id))
    }
}
