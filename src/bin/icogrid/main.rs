//! Command line front end: builds tables, runs layers over tensor files,
//! and compares dumps.

mod error;

use clap::Parser;
use error::CliError;
use icogrid::{
    args::{CommandTask, CompareCommand, ForwardCommand, IcoArgs, TablesCommand, VerifyCommand},
    component::run_component,
    config::EngineConfig,
    engine::{grid_tables, ForwardTrace, IcoConv},
    kernel::{expansion_indices, CompactKernel, SLOTS, TAPS},
    tensor::FeatureTensor,
    tensor_file::{TensorFile, TensorFileWriter},
    text_tensor::{write_indices, write_tensor, write_values, TextDump},
    topology::CHARTS,
    verify::{ComparisonReport, Verdict},
};

use log::{debug, info, warn};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};
use std::{
    fs::{self, File},
    io::BufWriter,
    path::Path,
    process::ExitCode,
    sync::mpsc::channel,
};

// Example:
// cargo run --bin icogrid -- tables -r 2 --in-rotations 6 -o tables
// cargo run --bin icogrid -- verify -r 3 --in-rotations 6 --frames 8
// cargo run --bin icogrid -- forward -c layer.ron -w w.bin -b b.bin
//                                    -i frames.bin -o out.bin --dump dumps

fn main() -> ExitCode {
    env_logger::init();
    let args = IcoArgs::parse();

    let result = match args.command {
        CommandTask::Tables(cmd) => tables(cmd),
        CommandTask::Verify(cmd) => verify(cmd),
        CommandTask::Forward(cmd) => forward(cmd),
        CommandTask::Compare(cmd) => compare(cmd),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("icogrid: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn tables(cmd: TablesCommand) -> Result<(), CliError> {
    let config = EngineConfig {
        resolution: cmd.resolution,
        in_channels: cmd.in_channels,
        in_rotations: cmd.in_rotations,
        out_channels: cmd.out_channels,
        out_rotations: cmd.out_rotations,
        ..EngineConfig::default()
    };
    config.validate()?;

    let tables = grid_tables(cmd.resolution)?;
    let topology = tables.topology();
    let table = tables.adjacency()?;
    println!(
        "resolution {}: {} vertices, {} stored, {} cone vertices, {} ambiguous padded cells",
        cmd.resolution,
        topology.vertex_count(),
        topology.stored_cells(),
        topology.cone_cells().len(),
        tables.padding().ambiguous().len()
    );
    let Some(dir) = cmd.outdir else {
        return Ok(());
    };
    let dir = Path::new(&dir);
    fs::create_dir_all(dir)?;

    let mut out = BufWriter::new(File::create(dir.join("neighbors.txt"))?);
    table.write_text(&mut out)?;

    let ids: Vec<i64> = table.flat_ids().into_iter().map(i64::from).collect();
    let mut out = BufWriter::new(File::create(dir.join("neighbor_ids.txt"))?);
    write_indices(&mut out, "neighbor_ids", &[table.len(), SLOTS], &ids)?;

    let (h, w) = (topology.height(), topology.width());
    let reorder = tables.padding().flat_indices(config.in_rotations)?;
    let mut out = BufWriter::new(File::create(dir.join("reorder_idx.txt"))?);
    write_indices(&mut out, "reorder_idx", &[config.in_rotations, CHARTS, h + 2, w + 2], &reorder)?;

    let expansion = expansion_indices(
        config.out_channels,
        config.out_rotations,
        config.in_channels,
        config.in_rotations,
    )?;
    let expansion: Vec<i64> = expansion.into_iter().map(i64::from).collect();
    let mut out = BufWriter::new(File::create(dir.join("kernel_expansion_idx.txt"))?);
    write_indices(
        &mut out,
        "kernel_expansion_idx",
        &[
            config.out_channels,
            config.out_rotations,
            config.in_channels,
            config.in_rotations,
            TAPS,
            4,
        ],
        &expansion,
    )?;

    info!("wrote neighbor, padding and kernel index tables to {}", dir.display());
    Ok(())
}

fn verify(cmd: VerifyCommand) -> Result<(), CliError> {
    let config = EngineConfig {
        resolution: cmd.resolution,
        in_channels: cmd.in_channels,
        in_rotations: cmd.in_rotations,
        out_channels: cmd.out_channels,
        out_rotations: cmd.out_rotations,
        ..EngineConfig::default()
    };
    config.validate()?;

    let mut rng = StdRng::seed_from_u64(cmd.seed);
    let dist = Uniform::new(-1.0f32, 1.0);
    let bias = (0..config.out_channels).map(|_| dist.sample(&mut rng)).collect();
    let kernel = CompactKernel::from_fn(
        config.out_channels,
        config.in_channels,
        config.in_rotations,
        bias,
        |_, _, _, _| dist.sample(&mut rng),
    )?;
    let conv = IcoConv::new(config, kernel)?;

    let frames: Vec<FeatureTensor> = (0..cmd.frames)
        .map(|_| FeatureTensor::from_fn(conv.input_shape(), |_, _, _, _, _| dist.sample(&mut rng)))
        .collect();
    let outputs = conv.forward_frames(&frames)?;
    debug!("ran {} frames through {}", outputs.len(), conv);

    let mut worst: Option<ComparisonReport> = None;
    for (i, frame) in frames.iter().enumerate() {
        let report = conv.cross_check(frame, cmd.tolerance)?;
        debug!("frame {}: max error {}", i, report.max_error);
        if worst.as_ref().map_or(true, |w| report.max_error > w.max_error) {
            worst = Some(report);
        }
    }
    match worst {
        Some(report) => println!("{}\n{}", conv, report),
        None => println!("{}: tables agree, no frames run", conv),
    }
    Ok(())
}

fn forward(cmd: ForwardCommand) -> Result<(), CliError> {
    let config = EngineConfig::from_path(&cmd.config)?;
    let bias = TensorFile::from_path(&cmd.bias)?;
    let kernel = TensorFile::from_path(&cmd.weights)?.into_kernel(bias, config.in_rotations)?;
    let frames = TensorFile::from_path(&cmd.input)?.into_frames()?;
    let conv = IcoConv::new(config, kernel)?;
    info!("{}: {} frames from {}", conv, frames.len(), cmd.input);

    if let (Some(dir), Some(first)) = (&cmd.dump, frames.first()) {
        let trace = conv.forward_trace(first)?;
        write_dumps(Path::new(dir), first, &trace)?;
    }

    let n_frames = frames.len();
    let output_shape = conv.output_shape();
    let writer = TensorFileWriter::new(&cmd.outfile, "output", output_shape);

    let (frame_tx, conv_rx) = channel();
    let (conv_tx, writer_rx) = channel();
    let (writer_tx, result_rx) = channel();
    let conv_thread = run_component(Box::new(conv), conv_rx, conv_tx);
    let writer_thread = run_component(Box::new(writer), writer_rx, writer_tx);

    for frame in frames {
        frame_tx.send(frame)?;
    }
    drop(frame_tx);

    let mut written = 0;
    for _ in 0..n_frames {
        written = result_rx.recv()??;
    }
    conv_thread.join().map_err(|_| CliError::JoinError)?;
    writer_thread.join().map_err(|_| CliError::JoinError)?;

    let check = TensorFile::from_path(&cmd.outfile)?;
    if check.frames() != written {
        warn!("wrote {} frames but {} read back", written, check.frames());
    }
    println!("wrote {} frames of {:?} to {}", check.frames(), output_shape.dims(), cmd.outfile);
    Ok(())
}

fn write_dumps(dir: &Path, input: &FeatureTensor, trace: &ForwardTrace) -> Result<(), CliError> {
    fs::create_dir_all(dir)?;
    let dump = |name: &str, tensor: &FeatureTensor| -> Result<(), CliError> {
        let mut out = BufWriter::new(File::create(dir.join(format!("{}.txt", name)))?);
        write_tensor(&mut out, name, tensor)?;
        Ok(())
    };
    dump("frame0_input", input)?;
    dump("frame0_padded", &trace.padded)?;
    dump("frame0_conv_output", &trace.convolved)?;
    dump("frame0_final_output", &trace.output)?;

    let k = &trace.expanded;
    let mut out = BufWriter::new(File::create(dir.join("frame0_kernel.txt"))?);
    write_values(&mut out, "frame0_kernel", &[k.out_planes(), k.in_planes(), 3, 3], k.taps())?;
    info!("wrote intermediates to {}", dir.display());
    Ok(())
}

fn load_values(path: &str) -> Result<(Option<Vec<usize>>, Vec<f32>), CliError> {
    let raw = fs::read(path)?;
    if raw.contains(&0xFF) {
        let file = TensorFile::from_bytes(&raw)?;
        return Ok((Some(file.dims()), file.samples().to_vec()));
    }
    let text = String::from_utf8_lossy(&raw);
    let dump = TextDump::parse(&text)?;
    Ok((dump.dims, dump.values))
}

fn compare(cmd: CompareCommand) -> Result<(), CliError> {
    let (expected_dims, expected) = load_values(&cmd.expected)?;
    let (found_dims, found) = load_values(&cmd.found)?;
    if let (Some(a), Some(b)) = (&expected_dims, &found_dims) {
        if a != b {
            warn!("dimensions differ: {:?} against {:?}", a, b);
        }
    }
    let report = ComparisonReport::new(&expected, &found)?;
    println!("{}", report);
    if report.verdict() != Verdict::Pass {
        warn!("{} and {} disagree", cmd.expected, cmd.found);
    }
    report.check(cmd.tolerance)?;
    Ok(())
}
