//! An explicit 7-neighbor table per stored vertex, derived from the mesh
//! rather than from the padding map, plus the scalar gather convolution
//! that runs on it.
//!
//! The builder glues the closed charts into a triangle mesh, checks that
//! the result is an icosphere, and then walks each vertex's ring: slots
//! whose offset stays inside the chart closure are read off directly, and
//! the remaining ones are found by stepping from one ring neighbor to the
//! next around the vertex. At a cone vertex the walk runs out of new
//! neighbors one slot early; that slot repeats the last neighbor with its
//! frame turned one step further.
//!
//! Frame shifts come from comparing the two vertices inside a chart
//! closure where both sit away from the closure corners, since corners
//! are where frames stop being well defined.

use std::io::{self, Write};

use log::{debug, trace};

use crate::error::IcoError;
use crate::kernel::{turn_slot, CompactKernel, SLOTS, SLOT_OFFSETS};
use crate::padding::check_rotations;
use crate::tensor::{FeatureTensor, Shape};
use crate::topology::{GridTopology, CHARTS, RING};

/// Neighbor ids and frame shifts of every stored vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjacencyTable {
    resolution: u32,
    stored: usize,
    ids: Vec<[usize; SLOTS]>,
    shifts: Vec<[u8; SLOTS]>,
}

impl AdjacencyTable {
    /// The resolution the table was built for.
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Number of rows, one per stored vertex.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Global ids of the center and six ring neighbors of `vertex`.
    pub fn neighbors(&self, vertex: usize) -> &[usize; SLOTS] {
        &self.ids[vertex]
    }

    /// Frame shifts matching [AdjacencyTable::neighbors].
    pub fn shifts(&self, vertex: usize) -> &[u8; SLOTS] {
        &self.shifts[vertex]
    }

    /// Whether `id` names a pole rather than a stored cell.
    pub fn is_pole(&self, id: usize) -> bool {
        id >= self.stored
    }

    /// Row-major `(vertex, slot)` ids, the layout scalar implementations
    /// load directly.
    pub fn flat_ids(&self) -> Vec<u32> {
        self.ids
            .iter()
            .flat_map(|row| row.iter().map(|&id| id as u32))
            .collect()
    }

    /// Writes one line per vertex: its id, the seven neighbor ids, and the
    /// seven shifts.
    pub fn write_text(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "# icosahedral neighbor table, resolution {}", self.resolution)?;
        writeln!(
            out,
            "# {} stored vertices, pole ids {} and {}",
            self.stored,
            self.stored,
            self.stored + 1
        )?;
        writeln!(out, "# vertex  n0 .. n6  s0 .. s6")?;
        for (v, (ids, shifts)) in self.ids.iter().zip(&self.shifts).enumerate() {
            write!(out, "{}", v)?;
            for id in ids {
                write!(out, " {}", id)?;
            }
            for s in shifts {
                write!(out, " {}", s)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ClosurePoint {
    chart: usize,
    row: isize,
    col: isize,
    frame: u8,
    corner: bool,
}

/// The charts glued along their seams.
struct Mesh {
    neighbors: Vec<Vec<usize>>,
    points: Vec<Vec<ClosurePoint>>,
    closure: Vec<(usize, u8)>,
    rows: usize,
    cols: usize,
}

impl Mesh {
    fn from_charts(topology: &GridTopology) -> Result<Self, IcoError> {
        let (h, w) = (topology.height() as isize, topology.width() as isize);
        let (rows, cols) = (h as usize + 1, w as usize + 1);
        let count = topology.vertex_count();
        let mut points = vec![Vec::new(); count];
        let mut closure = Vec::with_capacity(CHARTS * rows * cols);

        for chart in 0..CHARTS {
            for row in 0..=h {
                for col in 0..=w {
                    let resolved = topology.resolve(chart, row, col)?;
                    let id = topology.site_id(resolved.site);
                    let corner = matches!((row, col), (r, c) if r == h && (c == 0 || c == h || c == w))
                        || (row, col) == (0, w);
                    points[id].push(ClosurePoint {
                        chart,
                        row,
                        col,
                        frame: resolved.shift,
                        corner,
                    });
                    closure.push((id, resolved.shift));
                }
            }
        }

        let mut neighbors = vec![Vec::new(); count];
        let at = |chart: usize, row: usize, col: usize| closure[(chart * rows + row) * cols + col].0;
        for chart in 0..CHARTS {
            for i in 0..rows - 1 {
                for j in 0..cols - 1 {
                    let a = at(chart, i, j);
                    let b = at(chart, i, j + 1);
                    let c = at(chart, i + 1, j + 1);
                    let d = at(chart, i + 1, j);
                    for (x, y) in [(a, b), (b, c), (a, c), (c, d), (a, d)] {
                        if x != y {
                            neighbors[x].push(y);
                            neighbors[y].push(x);
                        }
                    }
                }
            }
        }
        for list in neighbors.iter_mut() {
            list.sort_unstable();
            list.dedup();
        }

        Ok(Mesh {
            neighbors,
            points,
            closure,
            rows,
            cols,
        })
    }

    /// Euler characteristic and degrees of an icosphere.
    fn check_icosphere(&self, topology: &GridTopology) -> Result<(), IcoError> {
        let n = topology.height();
        let edges: usize = self.neighbors.iter().map(Vec::len).sum::<usize>() / 2;
        if edges != 30 * n * n {
            return Err(IcoError::topology(format!(
                "glued charts have {} edges, an icosphere with {} vertices has {}",
                edges,
                topology.vertex_count(),
                30 * n * n
            )));
        }
        let cones = self.neighbors.iter().filter(|l| l.len() == 5).count();
        let regular = self.neighbors.iter().filter(|l| l.len() == RING).count();
        if cones != 12 || cones + regular != topology.vertex_count() {
            return Err(IcoError::topology(format!(
                "expected 12 vertices of degree 5 and the rest of degree 6, found {} and {}",
                cones, regular
            )));
        }
        Ok(())
    }

    fn closure_at(&self, chart: usize, row: isize, col: isize) -> Option<(usize, u8)> {
        if row < 0 || col < 0 || row as usize >= self.rows || col as usize >= self.cols {
            return None;
        }
        Some(self.closure[(chart * self.rows + row as usize) * self.cols + col as usize])
    }

    fn common(&self, a: usize, b: usize, skip: usize) -> Vec<usize> {
        self.neighbors[a]
            .iter()
            .filter(|&&x| x != skip && self.neighbors[b].binary_search(&x).is_ok())
            .copied()
            .collect()
    }

    /// Frame of `y` relative to `x`, read in a closure where the two are
    /// lattice neighbors and neither is a closure corner.
    fn frame_delta(&self, x: usize, y: usize) -> Option<u8> {
        self.points[x]
            .iter()
            .filter(|p| !p.corner)
            .find_map(|px| {
                self.points[y]
                    .iter()
                    .filter(|q| !q.corner && q.chart == px.chart)
                    .find(|q| SLOT_OFFSETS[1..].contains(&(q.row - px.row, q.col - px.col)))
                    .map(|q| (q.frame + RING as u8 - px.frame) % RING as u8)
            })
    }
}

/// Derives an [AdjacencyTable] from the seam table alone.
#[derive(Debug, Clone, Copy)]
pub struct AdjacencyTableBuilder<'a> {
    topology: &'a GridTopology,
}

impl<'a> AdjacencyTableBuilder<'a> {
    /// A builder for `topology`.
    pub fn new(topology: &'a GridTopology) -> Self {
        AdjacencyTableBuilder { topology }
    }

    /// Glues the charts, checks the mesh, and walks every ring.
    pub fn build(&self) -> Result<AdjacencyTable, IcoError> {
        let mesh = Mesh::from_charts(self.topology)?;
        mesh.check_icosphere(self.topology)?;

        let stored = self.topology.stored_cells();
        let mut ids = Vec::with_capacity(stored);
        let mut shifts = Vec::with_capacity(stored);
        for v in 0..stored {
            let (row_ids, row_shifts) = self.walk(&mesh, v)?;
            ids.push(row_ids);
            shifts.push(row_shifts);
        }

        debug!(
            "adjacency table for resolution {}: {} rows",
            self.topology.resolution(),
            ids.len()
        );

        Ok(AdjacencyTable {
            resolution: self.topology.resolution(),
            stored,
            ids,
            shifts,
        })
    }

    fn walk(&self, mesh: &Mesh, v: usize) -> Result<([usize; SLOTS], [u8; SLOTS]), IcoError> {
        let fail = |slot: Option<usize>, detail: String| IcoError::TopologyInconsistency {
            vertex: Some(v),
            slot,
            detail,
        };
        let cell = self
            .topology
            .cell_of(v)
            .ok_or_else(|| fail(None, "not a stored cell".to_string()))?;
        let (i, j) = (cell.row as isize, cell.col as isize);

        let mut ring: [Option<usize>; SLOTS] = [None; SLOTS];
        let mut shifts = [0u8; SLOTS];
        ring[0] = Some(v);
        for t in 1..SLOTS {
            let (di, dj) = SLOT_OFFSETS[t];
            if let Some((id, frame)) = mesh.closure_at(cell.chart, i + di, j + dj) {
                ring[t] = Some(id);
                shifts[t] = frame;
            }
        }

        let gap: Vec<usize> = (1..SLOTS).filter(|&t| ring[t].is_none()).collect();
        if let (Some(&first), Some(&last)) = (gap.first(), gap.last()) {
            if last - first + 1 != gap.len() {
                return Err(fail(Some(first), format!("unknown slots {:?} are not contiguous", gap)));
            }

            // walk backwards from the known slot after the gap
            let after = last % RING + 1;
            let mut prev = ring[after % RING + 1].ok_or_else(|| fail(Some(after), "empty anchor".into()))?;
            let mut cur = ring[after].ok_or_else(|| fail(Some(after), "empty anchor".into()))?;
            let mut cur_shift = shifts[after];
            let closing = ring[first - 1].ok_or_else(|| fail(Some(first - 1), "empty anchor".into()))?;
            let mut repeated = false;

            for &t in gap.iter().rev() {
                let found = mesh.common(v, cur, prev);
                let w = match found.as_slice() {
                    [w] => *w,
                    _ => {
                        return Err(fail(
                            Some(t),
                            format!("{} and {} share {} unvisited neighbors", v, cur, found.len()),
                        ))
                    }
                };

                if w == closing {
                    ring[t] = Some(cur);
                    shifts[t] = (cur_shift + 1) % RING as u8;
                    repeated = true;
                    continue;
                }

                let shift = if self.topology.cell_of(w).is_none() {
                    0
                } else if let Some(d) = mesh.frame_delta(v, w) {
                    d
                } else if let Some(d) = mesh.frame_delta(cur, w) {
                    (cur_shift + d) % RING as u8
                } else {
                    // every vertex involved is a corner somewhere, which
                    // only happens on the bare icosahedron
                    let (di, dj) = SLOT_OFFSETS[t];
                    trace!("vertex {} slot {}: frame taken from the seam crossing", v, t);
                    self.topology.resolve(cell.chart, i + di, j + dj)?.shift
                };

                ring[t] = Some(w);
                shifts[t] = shift;
                prev = cur;
                cur = w;
                cur_shift = shift;
            }

            if !repeated && mesh.common(v, cur, prev) != [closing] {
                return Err(fail(Some(first), "ring does not close".to_string()));
            }
        }

        let mut ids = [0usize; SLOTS];
        for (t, id) in ring.iter().enumerate() {
            ids[t] = id.ok_or_else(|| fail(Some(t), "slot left empty".to_string()))?;
        }

        let mut seen: Vec<usize> = ids[1..].to_vec();
        seen.sort_unstable();
        seen.dedup();
        if seen != mesh.neighbors[v] {
            return Err(fail(
                None,
                format!("ring {:?} does not match mesh neighbors {:?}", &ids[1..], mesh.neighbors[v]),
            ));
        }

        Ok((ids, shifts))
    }
}

/// Scalar reference convolution: for every vertex and output plane, a
/// direct multiply-accumulate over the seven table entries. Pole
/// neighbors contribute zero.
pub fn gather_forward(
    table: &AdjacencyTable,
    topology: &GridTopology,
    input: &FeatureTensor,
    kernel: &CompactKernel,
    out_rotations: usize,
) -> Result<FeatureTensor, IcoError> {
    check_rotations(out_rotations)?;
    let (cin, rin) = (kernel.in_channels(), kernel.in_rotations());
    input
        .shape()
        .expect(Shape::on_grid(topology, cin, rin), "gather input")?;
    if table.len() != topology.stored_cells() {
        return Err(IcoError::ShapeMismatch {
            what: "adjacency table rows",
            expected: vec![topology.stored_cells()],
            found: vec![table.len()],
        });
    }

    let out_shape = Shape::on_grid(topology, kernel.out_channels(), out_rotations);
    let plane_len = out_shape.plane_len();
    let mut out = FeatureTensor::zeros(out_shape);
    let data = out.data_mut();

    for co in 0..kernel.out_channels() {
        for ro in 0..out_rotations {
            let base = (co * out_rotations + ro) * plane_len;
            for v in 0..table.len() {
                let (ids, shifts) = (table.neighbors(v), table.shifts(v));
                let mut acc = kernel.bias()[co];
                for ci in 0..cin {
                    for ri in 0..rin {
                        let wr = (ri + rin - ro % rin) % rin;
                        for s in 0..SLOTS {
                            let t = turn_slot(s, ro);
                            if table.is_pole(ids[t]) {
                                continue;
                            }
                            let r = (ri + shifts[t] as usize) % rin;
                            acc += kernel.weight(co, ci, wr, s) * input.plane(ci, r)[ids[t]];
                        }
                    }
                }
                data[base + v] = acc;
            }
        }
    }

    Ok(out)
}
