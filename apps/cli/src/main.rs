use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use tnc_core::protocol::constants::BLOCK_SIZE;
use tnc_core::{
    FirmwareImage, FirmwareLoader, KissParameter, NullObserver, SerialTransport, Telemetry,
    TncClient, TncConfig, TncEvent, TncObserver, TracingObserver,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "KISS TNC configuration and firmware tool", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serial baud rate (overrides the configuration file)
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Write an Intel HEX image through the bootloader
    Upload {
        /// Serial port the bootloader is listening on
        #[arg(long)]
        port: Option<String>,

        /// Intel HEX firmware image
        #[arg(long)]
        firmware: PathBuf,

        /// Erase the chip before writing
        #[arg(long)]
        erase: bool,

        /// Report success without waiting for the TNC to reboot
        #[arg(long)]
        no_reboot_delay: bool,
    },
    /// Print telemetry and notices from a running TNC
    Monitor {
        #[arg(long)]
        port: Option<String>,

        /// Stop after this many seconds (default: until the TNC goes away)
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Change a KISS parameter and confirm the TNC applied it
    Set {
        #[arg(long)]
        port: Option<String>,

        param: Param,

        value: u8,
    },
    /// Parse a HEX file and list its segments
    Inspect { firmware: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Param {
    TxDelay,
    Persistence,
    SlotTime,
    TxTail,
    Duplex,
}

impl From<Param> for KissParameter {
    fn from(p: Param) -> Self {
        match p {
            Param::TxDelay => KissParameter::TxDelay,
            Param::Persistence => KissParameter::Persistence,
            Param::SlotTime => KissParameter::SlotTime,
            Param::TxTail => KissParameter::TxTail,
            Param::Duplex => KissParameter::Duplex,
        }
    }
}

/// Prints what the TNC reports to stdout.
struct ConsoleObserver;

impl TncObserver for ConsoleObserver {
    fn on_event(&self, event: &TncEvent) {
        match event {
            TncEvent::Telemetry(Telemetry::InputLevel(raw)) => {
                println!("input level: {:.2}", Telemetry::input_level_log2(*raw));
            }
            TncEvent::Telemetry(Telemetry::MacAddress(mac)) => println!("mac address: {mac}"),
            TncEvent::Telemetry(t) => println!("{t:?}"),
            TncEvent::Notice(text) => println!("notice: {text}"),
            other => TracingObserver.on_event(other),
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => TncConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TncConfig::default(),
    };
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }

    match args.command {
        Cmd::Upload {
            port,
            firmware,
            erase,
            no_reboot_delay,
        } => {
            let firmware = FirmwareImage::load(&firmware)?;
            print_segments(&firmware);

            config.upload.erase_before_write |= erase;
            if no_reboot_delay {
                config.upload.reboot_delay_ms = 0;
            }

            let transport = open(&config, port)?;
            let mut loader = FirmwareLoader::new(transport, firmware, config.upload);
            let result = loader.run_upload();
            if let Some(device) = loader.device_info() {
                println!("{device}");
            }
            result?;
            info!("Firmware upload complete");
        }
        Cmd::Monitor { port, seconds } => {
            let transport = open(&config, port)?;
            let mut client = TncClient::connect(transport, config.link, Arc::new(ConsoleObserver))?;

            let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
            while client.is_receiving() && deadline.is_none_or(|d| Instant::now() < d) {
                thread::sleep(Duration::from_millis(100));
            }
            client.disconnect();
        }
        Cmd::Set { port, param, value } => {
            let transport = open(&config, port)?;
            let client = TncClient::connect(transport, config.link, Arc::new(NullObserver))?;
            client.set_kiss_parameter(param.into(), value)?;
            println!("{param:?} = {value}");
        }
        Cmd::Inspect { firmware } => {
            let firmware = FirmwareImage::load(&firmware)?;
            print_segments(&firmware);
        }
    }

    Ok(())
}

fn open(config: &TncConfig, port: Option<String>) -> Result<SerialTransport> {
    let port = port
        .or_else(|| config.serial.port.clone())
        .ok_or_else(|| anyhow!("no serial port given (use --port or [serial] port)"))?;
    Ok(SerialTransport::open(&port, config.serial.baud_rate)?)
}

fn print_segments(firmware: &FirmwareImage) {
    for segment in firmware.segments() {
        println!(
            "{}: 0x{:04X}..0x{:04X} ({} bytes)",
            segment.memory_type,
            segment.start_address,
            segment.end_address(),
            segment.len()
        );
    }
    println!(
        "total: {} bytes in {} segment(s), {} blocks",
        firmware.total_len(),
        firmware.segments().len(),
        firmware.block_count(BLOCK_SIZE as usize)
    );
}
