use clap::{Args, Parser, Subcommand};
use colliderbb::core::models::ids::Ip;
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

#[derive(Parser, Debug)]
#[command(
    version,
    about = "colliderbb - Beam-beam lens installation, configuration and verification for two-beam collider models.",
    help_template = HELP_TEMPLATE,
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity level (-v for INFO, -vv for DEBUG, -vvv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all log output except for errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Write logs to a specified file in addition to the console output
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the longitudinal centroids of equal-charge slices of a Gaussian bunch.
    Slices(SlicesArgs),
    /// Install unconfigured beam-beam lenses into a collider checkpoint.
    Install(InstallArgs),
    /// Compute the luminosity at one IP from exported twiss tables.
    Luminosity(LuminosityArgs),
    /// Verify the configured beam-beam lenses of a checkpoint against exported tables.
    Verify(VerifyArgs),
    /// Summarize a collider checkpoint: lines, knobs and lenses.
    Inspect(InspectArgs),
}

/// Arguments for the `slices` subcommand.
#[derive(Args, Debug)]
pub struct SlicesArgs {
    /// Number of slices. Must be odd.
    #[arg(short, long, value_name = "INT")]
    pub num_slices: usize,

    /// RMS bunch length in metres.
    #[arg(short = 'z', long, value_name = "FLOAT")]
    pub sigma_z: f64,

    /// Print the signed slice index next to each centroid.
    #[arg(long)]
    pub indexed: bool,
}

/// Arguments for the `install` subcommand.
#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Collider checkpoint without beam-beam lenses (JSON).
    #[arg(short, long, required = true, value_name = "PATH")]
    pub input: PathBuf,

    /// Path of the checkpoint written after installation.
    #[arg(short, long, required = true, value_name = "PATH")]
    pub output: PathBuf,

    /// Configuration file in TOML format. HL-LHC defaults are used for missing values.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the number of head-on slices.
    #[arg(long, value_name = "INT")]
    pub num_slices_head_on: Option<usize>,

    /// Override the RMS bunch length in metres.
    #[arg(long, value_name = "FLOAT")]
    pub sigma_z: Option<f64>,

    /// Set a specific configuration value, overriding the config file.
    /// Can be used multiple times. Example: -S install.harmonic-number=35640
    #[arg(short = 'S', long = "set", value_name = "KEY=VALUE", num_args(0..))]
    pub set_values: Vec<String>,
}

/// Arguments for the `luminosity` subcommand.
#[derive(Args, Debug)]
pub struct LuminosityArgs {
    /// Twiss table of beam 1 (CSV with a TOML summary header).
    #[arg(long, required = true, value_name = "PATH")]
    pub twiss_b1: PathBuf,

    /// Twiss table of beam 2, in its own frame.
    #[arg(long, required = true, value_name = "PATH")]
    pub twiss_b2: PathBuf,

    /// Interaction point, e.g. 'ip8'.
    #[arg(long, required = true, value_name = "IP")]
    pub ip: Ip,

    /// Configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the number of colliding bunch pairs at the IP.
    #[arg(long, value_name = "INT")]
    pub num_colliding_bunches: Option<u32>,

    /// Override the bunch population.
    #[arg(long, value_name = "FLOAT")]
    pub num_particles_per_bunch: Option<f64>,

    /// Override the normalized horizontal emittance in metres.
    #[arg(long, value_name = "FLOAT")]
    pub nemitt_x: Option<f64>,

    /// Override the normalized vertical emittance in metres.
    #[arg(long, value_name = "FLOAT")]
    pub nemitt_y: Option<f64>,

    /// Override the RMS bunch length in metres.
    #[arg(long, value_name = "FLOAT")]
    pub sigma_z: Option<f64>,

    /// Treat the crossing angle as fully compensated by crab cavities.
    #[arg(long)]
    pub crab: bool,
}

/// Arguments for the `verify` subcommand.
#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Checkpoint with configured beam-beam lenses.
    #[arg(long, required = true, value_name = "PATH")]
    pub collider: PathBuf,

    /// Directory holding `twiss_<line>.csv` and the off-centre tables.
    #[arg(long, required = true, value_name = "DIR")]
    pub twiss_dir: PathBuf,

    /// Directory holding `survey_<line>_<ip>.csv`.
    #[arg(long, required = true, value_name = "DIR")]
    pub survey_dir: PathBuf,

    /// Configuration file in TOML format.
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Also compare tunes with the lenses on and off. Only meaningful when the
    /// exported tables follow the beam-beam scale knob.
    #[arg(long)]
    pub with_tunes: bool,
}

/// Arguments for the `inspect` subcommand.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Collider checkpoint to summarize.
    #[arg(long, required = true, value_name = "PATH")]
    pub collider: PathBuf,

    /// List every knob with its value and last provenance.
    #[arg(long)]
    pub knobs: bool,
}
