use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use simplelog::{
    ColorChoice, CombinedLogger, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use picloader::config::Timeouts;
use picloader::flashing::prepare_image;
use picloader::progress::{Fanout, ProgressBar, ProgressFile};
use picloader::transport::SerialTransport;
use picloader::{CancelToken, ChipDB, Config, ErrorCategory, Session, Transport};

#[derive(Parser)]
#[command(
    name = "picloader",
    version,
    about = "Command-line flasher for PIC16 MCUs running the Tiny Bootloader"
)]
struct Cli {
    /// Configuration file, may be given several times, later ones win
    #[arg(short, long, global = true)]
    config: Vec<PathBuf>,

    /// off, error, warn, info, debug or trace
    #[arg(short = 'v', long, global = true)]
    log_level: Option<String>,

    /// Serial port, the first one found when not configured
    #[arg(short, long, global = true)]
    device: Option<String>,

    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Read timeout of every exchange, in milliseconds
    #[arg(short, long, global = true)]
    timeout: Option<u64>,

    /// File receiving the completion percentage
    #[arg(short, long, global = true)]
    progress: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a HEX file to program memory
    Flash {
        /// Intel HEX file, `device.firmware` from the configuration if omitted
        path: Option<PathBuf>,
        /// Read every page back after writing it
        #[arg(long)]
        verify: bool,
        /// Write the image as is, without redirecting the reset vector.
        ///
        /// The slot the bootloader jumps to at start (just below the loader)
        /// is then written as erased (0xFF) if the last user page is
        /// programmed, so the application is only reached through the loader
        /// if the image places its own jump there.
        #[arg(long)]
        no_relocate: bool,
    },
    /// Reset the device and identify it
    Info {},
    /// Run the configured reset procedure only
    Reset {},
    /// Write the image that would be flashed as Intel HEX
    Dump {
        path: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List serial ports
    Ports {},
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        let code = match e.downcast_ref::<picloader::Error>() {
            Some(err) => {
                eprintln!("{}", hint(err.category()));
                err.exit_code()
            }
            None => 255,
        };
        std::process::exit(code);
    }
}

fn hint(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Config => "Check the configuration and the command line.",
        ErrorCategory::Image => "Check the firmware file.",
        ErrorCategory::Connection => "Check the serial port, the wiring and the reset setup.",
        ErrorCategory::Device => "The device rejected or corrupted the data.",
        ErrorCategory::Cancelled => "Flashing was cancelled, the device may not boot.",
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    init_logger(&config)?;

    match cli.command {
        Commands::Ports {} => {
            let ports = SerialTransport::scan_ports()?;
            if ports.is_empty() {
                log::warn!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
        }
        Commands::Dump { path, output } => {
            let name = config
                .device
                .name
                .as_deref()
                .ok_or_else(|| picloader::Error::Config("dump needs device.name".into()))?;
            let chip = ChipDB::load()?.find_by_name(name)?;
            let image = picloader::format::read_firmware_from_file(&path)?;
            let prepared = prepare_image(&image, &chip, config.flash.relocate_reset_vector)?;
            let text = picloader::format::write_ihex(&prepared)?;
            match output {
                Some(out) => {
                    std::fs::write(&out, text)
                        .with_context(|| format!("failed to write {}", out.display()))?;
                    log::info!("Image written to {}", out.display());
                }
                None => print!("{}", text),
            }
        }
        Commands::Info {} => {
            let mut session = open_session(&config)?;
            let chip = session.detect()?;
            log::info!(
                "Chip: {} (Flash: {} words, page: {} words, bootloader: {} words)",
                chip,
                chip.flash_size,
                chip.page_size,
                chip.bootloader_size
            );
            log::info!(
                "User program: 0x0000..{:#06x}, loader entry at word {:#06x}",
                chip.user_limit(),
                chip.loader_entry_word()
            );
        }
        Commands::Reset {} => {
            let mut session = open_session(&config)?;
            session.reset()?;
            log::info!("Device reset");
        }
        Commands::Flash {
            path,
            verify,
            no_relocate,
        } => {
            let path = path
                .or_else(|| config.device.firmware.clone())
                .ok_or(picloader::Error::NoFirmware)?;
            let image = picloader::format::read_firmware_from_file(&path)?;

            let mut config = config;
            config.flash.verify |= verify;
            if no_relocate {
                config.flash.relocate_reset_vector = false;
            }

            let cancel = CancelToken::new();
            let handle = cancel.clone();
            ctrlc::set_handler(move || {
                log::warn!("Interrupted or terminated, stopping after the current page...");
                handle.cancel();
            })
            .context("failed to install the interrupt handler")?;

            let mut observer = Fanout::new().with(ProgressBar::new());
            if let Some(file) = &config.flash.progress_file {
                observer = observer.with(ProgressFile::new(file));
            }

            let mut session = open_session(&config)?;
            let result = session.run(&image, &mut observer, &cancel);
            let pages = result
                .into_result()
                .with_context(|| format!("failed to flash {}", path.display()))?;
            log::info!("{} page(s) flashed", pages);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(&Config::default_paths(), &cli.config)?;
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    if let Some(port) = &cli.device {
        config.serial.port = Some(port.clone());
    }
    if let Some(baud) = cli.baud {
        config.serial.baud = baud;
    }
    if let Some(ms) = cli.timeout {
        config.timeouts = Timeouts::uniform(ms);
    }
    if let Some(progress) = &cli.progress {
        config.flash.progress_file = Some(progress.clone());
    }
    config.validate()?;
    Ok(config)
}

fn init_logger(config: &Config) -> Result<()> {
    let level = LevelFilter::from_str(&config.log.level).map_err(|_| {
        picloader::Error::Config(format!("invalid log level {:?}", config.log.level))
    })?;
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &config.log.file {
        let file = File::create(path)
            .with_context(|| format!("failed to create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, simplelog::Config::default(), file));
    }
    let _ = CombinedLogger::init(loggers);
    Ok(())
}

fn open_session(config: &Config) -> Result<Session<SerialTransport>> {
    let baud = config.serial.baud;
    let transport = match &config.serial.port {
        Some(port) => SerialTransport::open(port, baud)?,
        None => SerialTransport::open_any(baud)?,
    };
    let mut session = Session::new(transport, config)?;
    if let Some(port) = &config.serial.reset_port {
        let line: Box<dyn Transport> = Box::new(SerialTransport::open(port, baud)?);
        session = session.with_reset_line(line);
    }
    Ok(session)
}
