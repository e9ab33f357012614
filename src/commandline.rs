use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;

const fn about_text() -> &'static str {
    "SunSpec inverter monitor - polls inverter telemetry over Modbus TCP and republishes it."
}

#[derive(Parser, Debug)]
#[command(name = "sunmon", author, version, about = about_text(), long_about = None)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is off.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yml")]
    pub config: PathBuf,
}
