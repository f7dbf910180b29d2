#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use serial_boot16::host::Step;
use serial_boot16::{Image, Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    command: Operation,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "19200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Check the bootloader is responding
    Sync,

    /// Read and display the device info record
    Info,

    /// Erase the flash row containing an address
    Erase {
        /// Word address, hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u16,
    },

    /// Write words at an address
    Write {
        /// Word address, hex
        #[structopt(parse(try_from_str = parse_hex))]
        address: u16,

        /// Words to write, hex
        #[structopt(parse(try_from_str = parse_hex), required = true)]
        words: Vec<u16>,
    },

    /// Program an Intel HEX application image
    Program {
        /// Firmware file
        file: String,

        /// Stay in the bootloader once programmed
        #[structopt(long)]
        no_reboot: bool,
    },

    /// Leave the bootloader and start the application
    Reboot,
}

fn parse_hex(s: &str) -> Result<u16, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16)
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("opening serial port {}", o.port))?;

    info!("Connecting to bootloader");

    p.sync().context("connecting to bootloader")?;

    info!("Bootloader connected!");

    match o.command {
        Operation::Sync => (),
        Operation::Info => {
            let i = p.info()?;
            let flash = bytefmt::format(u64::from(i.flash_size));

            info!("Device:     {}", i.name());
            info!("Family:     {:?} (0x{:04x})", i.family(), i.family);
            info!("Flash:      {}", flash);
            info!("Erase row:  {} words", i.erase_row);
            info!("Write row:  {} words", i.write_row);
            info!("Revision:   {}.{}", i.revision >> 8, i.revision & 0xFF);
            info!("Bootloader: 0x{:04x}", i.boot_start);
        }
        Operation::Erase { address } => {
            p.info()?;
            p.erase(address)?;
            info!("Erased row at 0x{:04x}", address);
        }
        Operation::Write { address, words } => {
            p.info()?;
            p.write(address, &words)?;
            info!("Wrote {} words at 0x{:04x}", words.len(), address);
        }
        Operation::Program { file, no_reboot } => {
            let i = p.info()?;
            p.enter_bootloader()?;

            let image = Image::from_file(&file, (i.flash_size / 2) as usize)?;

            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:>16} [{bar:40}] {pos}/{len}")
                    .progress_chars("=> "),
            );

            p.program(&image, |step, done, total| {
                bar.set_length(total as u64);
                bar.set_position(done as u64);
                match step {
                    Step::Erase(a) => bar.set_message(&format!("erase 0x{:04x}", a)),
                    Step::Write(a) => bar.set_message(&format!("write 0x{:04x}", a)),
                    Step::Skip(a) => bar.set_message(&format!("skip 0x{:04x}", a)),
                }
            })?;

            bar.finish_with_message("done");
            info!("Programmed {}", file);

            if !no_reboot {
                p.reboot()?;
                info!("Application started");
            }
        }
        Operation::Reboot => {
            p.reboot()?;
            info!("Application started");
        }
    }

    Ok(())
}
