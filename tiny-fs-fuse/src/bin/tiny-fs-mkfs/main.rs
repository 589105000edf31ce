mod cli;

use std::fs::OpenOptions;
use std::io;
use std::sync::{Arc, Mutex};

use clap::Parser;
use cli::Cli;
use log::info;

use block_dev::SECTOR_SIZE;
use tiny_fs::FileSys;
use tiny_fs_fuse::BlockFile;

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&cli.image)?;
    fd.set_len(cli.sectors as u64 * SECTOR_SIZE as u64)?;

    info!("formatting {} ({} sectors)", cli.image.display(), cli.sectors);
    let device = Arc::new(BlockFile(Mutex::new(fd)));
    let fs = FileSys::mount(device, true);
    fs.shutdown();

    println!(
        "{}: {} sectors, {} free",
        cli.image.display(),
        cli.sectors,
        fs.free_sectors()
    );
    Ok(())
}
