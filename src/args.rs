// Commandline argument parser using clap for icogrid

use clap::{Args, Parser, Subcommand};

use crate::verify::PASS_TOLERANCE;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Convolution on the icosahedral grid
pub struct IcoArgs {
    #[command(subcommand, long_about)]
    /// Which task to perform
    pub command: CommandTask,
}

/// The tasks the binary can perform.
#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Build and check the neighbor tables for one resolution
    #[command(about)]
    Tables(TablesCommand),

    /// Run random frames through the layer and cross-check against the
    /// table-driven reference
    #[command(about)]
    Verify(VerifyCommand),

    /// Run a layer over the frames of a tensor file
    #[command(about)]
    Forward(ForwardCommand),

    /// Compare two dumps, binary or text, value by value
    #[command(about)]
    Compare(CompareCommand),
}

/// Arguments of [CommandTask::Tables].
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct TablesCommand {
    /// Subdivision level, so charts are 2^r rows tall
    #[arg(short, long)]
    pub resolution: i64,

    /// Directory to write the neighbor, padding and kernel index tables to
    #[arg(short = 'o', long = "out")]
    pub outdir: Option<String>,

    /// Input feature channels of the layer the kernel table is for
    #[arg(long, default_value_t = 1)]
    pub in_channels: usize,

    /// Input rotations, 1 or 6; also picks the padding table's layout
    #[arg(long, default_value_t = 1)]
    pub in_rotations: usize,

    /// Output feature channels of the layer the kernel table is for
    #[arg(long, default_value_t = 32)]
    pub out_channels: usize,

    /// Output rotations, 1 or 6
    #[arg(long, default_value_t = 6)]
    pub out_rotations: usize,
}

/// Arguments of [CommandTask::Verify].
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct VerifyCommand {
    /// Subdivision level, so charts are 2^r rows tall
    #[arg(short, long, default_value_t = 2)]
    pub resolution: i64,

    /// Input feature channels
    #[arg(long, default_value_t = 1)]
    pub in_channels: usize,

    /// Input rotations, 1 or 6
    #[arg(long, default_value_t = 1)]
    pub in_rotations: usize,

    /// Output feature channels
    #[arg(long, default_value_t = 32)]
    pub out_channels: usize,

    /// Output rotations, 1 or 6
    #[arg(long, default_value_t = 6)]
    pub out_rotations: usize,

    /// Number of random frames to run
    #[arg(short, long, default_value_t = 4)]
    pub frames: usize,

    /// Seed for the random weights and frames
    #[arg(short, long, default_value_t = 0)]
    pub seed: u64,

    /// Largest allowed difference between the two paths
    #[arg(short, long, default_value_t = PASS_TOLERANCE)]
    pub tolerance: f32,
}

/// Arguments of [CommandTask::Forward].
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct ForwardCommand {
    /// Layer configuration, in ron
    #[arg(short, long)]
    pub config: String,

    /// Weights tensor file, shaped (out, in x in_rotations, 7)
    #[arg(short, long)]
    pub weights: String,

    /// Bias tensor file, shaped (out)
    #[arg(short, long)]
    pub bias: String,

    /// Input tensor file, one or more frames shaped (in, in_rotations, 5, H, W)
    #[arg(short, long)]
    pub input: String,

    /// Where to write the output frames
    #[arg(short = 'o', long = "out")]
    pub outfile: String,

    /// Directory to write text dumps of every intermediate of the first frame
    #[arg(short, long)]
    pub dump: Option<String>,
}

/// Arguments of [CommandTask::Compare].
#[derive(Debug, Args, Clone)]
#[command(version, about)]
pub struct CompareCommand {
    /// Reference dump
    pub expected: String,

    /// Dump under test
    pub found: String,

    /// Largest allowed difference
    #[arg(short, long, default_value_t = PASS_TOLERANCE)]
    pub tolerance: f32,
}
