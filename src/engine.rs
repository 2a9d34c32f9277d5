//! The convolution layer as callers see it.
//!
//! [IcoConv] owns the weights and a shared handle to the tables of its
//! resolution. The tables are built once per resolution per process and
//! are read-only afterwards, so any number of engines and threads can use
//! them at the same time. Weights can be swapped between calls without
//! touching the tables.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    thread,
};

use log::{debug, info};

use crate::adjacency::{gather_forward, AdjacencyTable, AdjacencyTableBuilder};
use crate::component::{Component, ComponentError};
use crate::config::EngineConfig;
use crate::conv::{convolve, seam_copies};
use crate::error::IcoError;
use crate::kernel::{CompactKernel, ExpandedKernel};
use crate::padding::PaddingIndexMap;
use crate::reconcile::{ReconcileMode, SeamReconciler};
use crate::tensor::{FeatureTensor, Shape};
use crate::topology::GridTopology;
use crate::verify::{check_topology, ComparisonReport};

/// Everything derived from the resolution alone.
#[derive(Debug)]
pub struct GridTables {
    topology: GridTopology,
    padding: PaddingIndexMap,
    adjacency: OnceLock<Result<AdjacencyTable, IcoError>>,
}

impl GridTables {
    /// Builds the topology and padding map. The adjacency table is only
    /// needed for verification and is built on first use.
    pub fn new(resolution: i64) -> Result<Self, IcoError> {
        let topology = GridTopology::new(resolution)?;
        let padding = PaddingIndexMap::new(&topology)?;
        Ok(GridTables {
            topology,
            padding,
            adjacency: OnceLock::new(),
        })
    }

    /// The grid.
    pub fn topology(&self) -> &GridTopology {
        &self.topology
    }

    /// The padding map.
    pub fn padding(&self) -> &PaddingIndexMap {
        &self.padding
    }

    /// The adjacency table, checked against the padding map the first time
    /// it is asked for.
    pub fn adjacency(&self) -> Result<&AdjacencyTable, IcoError> {
        self.adjacency
            .get_or_init(|| {
                let table = AdjacencyTableBuilder::new(&self.topology).build()?;
                check_topology(&self.topology, &self.padding, &table)?;
                Ok(table)
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

fn cache() -> &'static Mutex<HashMap<u32, Arc<GridTables>>> {
    static TABLES: OnceLock<Mutex<HashMap<u32, Arc<GridTables>>>> = OnceLock::new();
    TABLES.get_or_init(Default::default)
}

/// The process-wide tables for `resolution`, built on first request.
pub fn grid_tables(resolution: i64) -> Result<Arc<GridTables>, IcoError> {
    let topology = GridTopology::new(resolution)?;
    let mut cache = cache().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(tables) = cache.get(&topology.resolution()) {
        return Ok(Arc::clone(tables));
    }
    info!("building grid tables for resolution {}", resolution);
    let tables = Arc::new(GridTables::new(resolution)?);
    cache.insert(topology.resolution(), Arc::clone(&tables));
    Ok(tables)
}

/// Every intermediate of one forward pass, for dumping.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    /// `(Cin, Rin, 5, H+2, W+2)`
    pub padded: FeatureTensor,
    /// The stencils used
    pub expanded: ExpandedKernel,
    /// `(Cout, Rout, 5, H+2, W+2)`, before cropping
    pub convolved: FeatureTensor,
    /// `(Cout, Rout, 5, H, W)`, reconciled and activated
    pub output: FeatureTensor,
}

/// One icosahedral convolution layer.
#[derive(Debug, Clone)]
pub struct IcoConv {
    config: EngineConfig,
    tables: Arc<GridTables>,
    kernel: CompactKernel,
    expanded: ExpandedKernel,
    reconciler: SeamReconciler,
}

impl IcoConv {
    /// Validates `config`, fetches the tables for its resolution, and
    /// expands `kernel`.
    pub fn new(config: EngineConfig, kernel: CompactKernel) -> Result<Self, IcoError> {
        config.validate()?;
        check_kernel(&config, &kernel)?;
        let tables = grid_tables(config.resolution)?;
        let expanded = ExpandedKernel::expand(&kernel, config.out_rotations)?;
        debug!(
            "layer at resolution {}: {}x{} -> {}x{}, {:?}",
            config.resolution,
            config.in_channels,
            config.in_rotations,
            config.out_channels,
            config.out_rotations,
            config.reconcile
        );
        Ok(IcoConv {
            reconciler: SeamReconciler::new(config.reconcile),
            config,
            tables,
            kernel,
            expanded,
        })
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared tables.
    pub fn tables(&self) -> &GridTables {
        &self.tables
    }

    /// The current weights.
    pub fn kernel(&self) -> &CompactKernel {
        &self.kernel
    }

    /// Replaces the weights. The tables are left alone.
    pub fn set_weights(&mut self, kernel: CompactKernel) -> Result<(), IcoError> {
        check_kernel(&self.config, &kernel)?;
        self.expanded = ExpandedKernel::expand(&kernel, self.config.out_rotations)?;
        self.kernel = kernel;
        Ok(())
    }

    /// Only accepts the mode the engine was configured with.
    pub fn set_reconcile_mode(&mut self, mode: ReconcileMode) -> Result<(), IcoError> {
        self.reconciler.configure(mode)
    }

    /// `(Cin, Rin, 5, H, W)`
    pub fn input_shape(&self) -> Shape {
        Shape::on_grid(
            self.tables.topology(),
            self.config.in_channels,
            self.config.in_rotations,
        )
    }

    /// `(Cout, Rout, 5, H, W)`
    pub fn output_shape(&self) -> Shape {
        Shape::on_grid(
            self.tables.topology(),
            self.config.out_channels,
            self.config.out_rotations,
        )
    }

    /// Pads, convolves, crops, reconciles, and activates one frame.
    pub fn forward(&self, input: &FeatureTensor) -> Result<FeatureTensor, IcoError> {
        input.shape().expect(self.input_shape(), "input tensor")?;
        let padded = self.tables.padding().apply(input)?;
        let convolved = convolve(padded, &self.expanded)?;
        self.finish(input, &convolved)
    }

    /// Like [IcoConv::forward] but keeps every intermediate.
    pub fn forward_trace(&self, input: &FeatureTensor) -> Result<ForwardTrace, IcoError> {
        input.shape().expect(self.input_shape(), "input tensor")?;
        let padded = self.tables.padding().apply(input)?;
        let convolved = convolve(padded.clone(), &self.expanded)?;
        let output = self.finish(input, &convolved)?;
        Ok(ForwardTrace {
            padded,
            expanded: self.expanded.clone(),
            convolved,
            output,
        })
    }

    fn finish(&self, input: &FeatureTensor, convolved: &FeatureTensor) -> Result<FeatureTensor, IcoError> {
        let mut output = convolved.crop(1)?;
        let copies = seam_copies(self.tables.padding(), input, &self.expanded, &output)?;
        self.reconciler.reconcile(&mut output, &copies)?;
        self.config.activation.apply(output.data_mut());
        Ok(output)
    }

    /// Runs independent frames, such as the time steps of a clip, spread
    /// over the available cores. Results keep the input order.
    pub fn forward_frames(&self, frames: &[FeatureTensor]) -> Result<Vec<FeatureTensor>, IcoError> {
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, frames.len());
        let per_worker = frames.len().div_ceil(workers);

        let chunks: Vec<Result<Vec<FeatureTensor>, IcoError>> = thread::scope(|scope| {
            let handles: Vec<_> = frames
                .chunks(per_worker)
                .map(|chunk| {
                    scope.spawn(move || chunk.iter().map(|f| self.forward(f)).collect::<Result<Vec<_>, _>>())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut out = Vec::with_capacity(frames.len());
        for chunk in chunks {
            out.extend(chunk?);
        }
        Ok(out)
    }

    /// The scalar gather convolution over the adjacency table, activated
    /// but with cone vertices left at their canonical copy.
    pub fn gather_reference(&self, input: &FeatureTensor) -> Result<FeatureTensor, IcoError> {
        let table = self.tables.adjacency()?;
        let mut out = gather_forward(
            table,
            self.tables.topology(),
            input,
            &self.kernel,
            self.config.out_rotations,
        )?;
        self.config.activation.apply(out.data_mut());
        Ok(out)
    }

    /// Compares the dense path, before reconciliation, against
    /// [IcoConv::gather_reference].
    pub fn cross_check(&self, input: &FeatureTensor, tolerance: f32) -> Result<ComparisonReport, IcoError> {
        input.shape().expect(self.input_shape(), "input tensor")?;
        let padded = self.tables.padding().apply(input)?;
        let mut dense = convolve(padded, &self.expanded)?.crop(1)?;
        self.config.activation.apply(dense.data_mut());
        let gathered = self.gather_reference(input)?;
        let report = ComparisonReport::new(gathered.data(), dense.data())?;
        report.check(tolerance)?;
        Ok(report)
    }
}

fn check_kernel(config: &EngineConfig, kernel: &CompactKernel) -> Result<(), IcoError> {
    let expected = [config.out_channels, config.in_channels, config.in_rotations];
    let found = [kernel.out_channels(), kernel.in_channels(), kernel.in_rotations()];
    if expected != found {
        return Err(IcoError::ShapeMismatch {
            what: "kernel for configured layer",
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }
    Ok(())
}

impl fmt::Display for IcoConv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "IcoConv(r={}, {}x{}->{}x{})",
            self.config.resolution,
            self.config.in_channels,
            self.config.in_rotations,
            self.config.out_channels,
            self.config.out_rotations
        )
    }
}

impl Component for IcoConv {
    type InData = FeatureTensor;
    type OutData = Result<FeatureTensor, IcoError>;

    fn convert(&mut self, input: FeatureTensor) -> Self::OutData {
        self.forward(&input)
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }
}
