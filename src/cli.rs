use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sshttp",
    version,
    about = "HTTP(S) forwarding proxy over SSH bastions",
    long_about = None
)]
pub struct Cli {
    #[arg(
        short = 'c',
        long,
        default_value = "./config.yml",
        help = "Configuration file path"
    )]
    pub config: PathBuf,

    #[arg(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,
}
