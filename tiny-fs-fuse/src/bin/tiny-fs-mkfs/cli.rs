use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Disk image to create or reformat
    #[arg(long, short)]
    pub image: PathBuf,

    /// Device capacity in sectors
    #[arg(long, short, default_value_t = 16 * 2048)]
    pub sectors: u32,
}
