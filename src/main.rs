use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{bail, ensure, Result};
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use eefs::{EepromFs, FileEeprom, Status};

#[derive(Parser)]
struct Cli {
    /// Backing file emulating the EEPROM
    #[arg(long, default_value = FileEeprom::DEFAULT_PATH)]
    device: PathBuf,
    /// Device capacity in bytes (multiple of 4)
    #[arg(long, default_value_t = FileEeprom::DEFAULT_SIZE)]
    size: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Erase the device and write an empty file table
    Format,
    /// Store TEXT (with a trailing NUL appended) in SLOT
    Write {
        #[arg(index = 1)]
        slot: u8,
        #[arg(index = 2)]
        text: String,
    },
    /// Delete the file in SLOT
    Delete {
        #[arg(index = 1)]
        slot: u8,
    },
    /// List active files and usage
    Ls,
    /// Print the payload stored in SLOT
    Cat {
        #[arg(index = 1)]
        slot: u8,
    },
    /// Print the file system status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    trace!("starting up eefs cli");

    let fs = EepromFs::new(FileEeprom::new(&cli.device, cli.size));
    match cli.command {
        Command::Format => {
            fs.enable_write();
            ensure!(fs.format(), "format failed: {}", fs.status());
            println!(
                "formatted, {} of {} bytes used",
                fs.used_capacity(),
                fs.total_capacity()
            );
        }
        Command::Write { slot, text } => {
            let mut payload = text.into_bytes();
            ensure!(
                payload.iter().all(|b| (0x20..=0x7E).contains(b)),
                "payload must be printable ASCII"
            );
            payload.push(0);
            fs.enable_write();
            ensure!(fs.write_file(slot, &payload), "write failed: {}", fs.status());
            println!(
                "wrote {} bytes to slot {slot}, {} of {} bytes used",
                payload.len(),
                fs.used_capacity(),
                fs.total_capacity()
            );
        }
        Command::Delete { slot } => {
            fs.enable_write();
            ensure!(fs.delete_file(slot), "delete failed: {}", fs.status());
            println!(
                "deleted slot {slot}, {} of {} bytes used",
                fs.used_capacity(),
                fs.total_capacity()
            );
        }
        Command::Ls => {
            if fs.status() == Status::InvalidTable {
                bail!("file system is not valid ({}), format it first", fs.status());
            }
            for (slot, size) in fs.active_files() {
                println!("{slot:>4}  {size} bytes");
            }
            println!(
                "{} files, {} of {} bytes used",
                fs.active_file_count(),
                fs.used_capacity(),
                fs.total_capacity()
            );
        }
        Command::Cat { slot } => {
            let Some(handle) = fs.open(slot) else {
                bail!("cannot open slot {slot}: {}", fs.status());
            };
            let text = fs
                .with_data(&handle, |bytes| {
                    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                    String::from_utf8_lossy(&bytes[..end]).into_owned()
                })
                .unwrap_or_default();
            fs.close(slot);
            println!("{text}");
        }
        Command::Status => {
            println!("{}", fs.status());
        }
    }
    Ok(())
}
