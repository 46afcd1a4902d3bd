use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};

use dataload::config::AppConfig;
use dataload::protocol::messages::STATUS_UPLOAD_COMPLETED;
use dataload::{Certificate, DataLoader, FileNotAvailablePolicy, Load, TransferConfig};

#[derive(Parser)]
#[command(name = "dataload")]
#[command(about = "ARINC-615A style data loader", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover target hardware on the local network
    Find {
        /// Discovery port the targets listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// How long to collect announcements, e.g. "5s"
        #[arg(short, long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Unicast the request to one address instead of broadcasting
        #[arg(long)]
        ip: Option<IpAddr>,
    },

    /// Upload software loads to one target hardware unit
    Upload {
        /// Target hardware identifier, e.g. "FMC-4200"
        #[arg(long)]
        id: String,

        /// Target hardware IP address
        #[arg(long)]
        ip: IpAddr,

        /// Target hardware position, e.g. "L"
        #[arg(long, default_value = "1")]
        pos: String,

        /// Certificate file presented during initialization
        #[arg(long)]
        cert: Option<std::path::PathBuf>,

        /// Loads as FILE:PARTNUMBER pairs
        #[arg(value_name = "LOAD", required = true)]
        loads: Vec<String>,

        /// TFTP server port on the target hardware
        #[arg(long)]
        target_port: Option<u16>,

        /// Local TFTP server port the target pulls files from
        #[arg(long)]
        dataloader_port: Option<u16>,

        /// Keep going when the target requests an unknown file
        #[arg(long)]
        skip_missing: bool,
    },

    /// Generate configuration file (.dataload.toml) in current directory
    Genconfig {
        /// Force overwrite existing configuration file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logger, default info level, display file line number and time
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}:{}] {level_style}{}{level_style:#}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    // Try to load configuration file
    let config_path = ".dataload.toml";
    let app_config = if std::path::Path::new(config_path).exists() {
        match AppConfig::load_from_file(config_path) {
            Ok(cfg) => {
                let abs_path = std::fs::canonicalize(config_path)
                    .unwrap_or_else(|_| std::path::PathBuf::from(config_path));
                info!("Using configuration file: {}", abs_path.display());
                Some(cfg)
            }
            Err(e) => {
                error!("Failed to load configuration file: {}, using defaults", e);
                None
            }
        }
    } else {
        None
    };

    match cli.command {
        Commands::Find { port, timeout, ip } => {
            let file_cfg = app_config.and_then(|c| c.find);
            run_find(
                port.or(file_cfg.as_ref().and_then(|c| c.port)),
                timeout.or(file_cfg.as_ref().and_then(|c| c.timeout)),
                ip,
            )?;
        }

        Commands::Upload {
            id,
            ip,
            pos,
            cert,
            loads,
            target_port,
            dataloader_port,
            skip_missing,
        } => {
            let file_cfg = app_config.and_then(|c| c.upload);
            let args = UploadArgs {
                id,
                ip,
                pos,
                cert,
                loads,
                target_port: target_port.or(file_cfg.as_ref().and_then(|c| c.target_port)),
                dataloader_port: dataloader_port
                    .or(file_cfg.as_ref().and_then(|c| c.dataloader_port)),
                skip_missing: skip_missing
                    || file_cfg.as_ref().and_then(|c| c.skip_missing).unwrap_or(false),
                block_timeout: file_cfg.as_ref().and_then(|c| c.block_timeout),
                max_retries: file_cfg.as_ref().and_then(|c| c.max_retries),
                status_timeout: file_cfg.as_ref().and_then(|c| c.status_timeout),
            };
            if !run_upload(args)? {
                std::process::exit(1);
            }
        }

        Commands::Genconfig { force } => {
            if let Err(e) = AppConfig::generate_config_file(force) {
                error!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn run_find(port: Option<u16>, timeout: Option<Duration>, ip: Option<IpAddr>) -> Result<()> {
    let loader = DataLoader::new();
    let handle = loader.create_handler()?;
    if let Some(port) = port {
        loader.set_discovery_port(handle, port)?;
    }
    if let Some(timeout) = timeout {
        loader.set_find_timeout(handle, timeout)?;
    }
    if let Some(ip) = ip {
        loader.set_target_hardware_ip(handle, ip)?;
    }

    loader.register_find_new_device_callback(handle, |_, device| {
        println!(
            "{:<16} {:<4} {:<16} {}",
            device.hardware.target_hardware_identifier,
            device.hardware.target_hardware_position,
            device.ip,
            device.mac
        );
    })?;

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    loader.register_find_finished_callback(handle, move |_| {
        let _ = tx.lock().unwrap().send(());
    })?;

    println!(
        "{:<16} {:<4} {:<16} {}",
        "HARDWARE", "POS", "IP", "MAC"
    );
    loader.find(handle)?;
    rx.recv().context("find worker vanished")?;
    loader.destroy_handler(handle)?;
    Ok(())
}

struct UploadArgs {
    id: String,
    ip: IpAddr,
    pos: String,
    cert: Option<std::path::PathBuf>,
    loads: Vec<String>,
    target_port: Option<u16>,
    dataloader_port: Option<u16>,
    skip_missing: bool,
    block_timeout: Option<Duration>,
    max_retries: Option<u32>,
    status_timeout: Option<Duration>,
}

fn run_upload(args: UploadArgs) -> Result<bool> {
    let loads = args
        .loads
        .iter()
        .map(|spec| {
            spec.split_once(':')
                .map(|(name, part)| Load::new(name, part))
                .with_context(|| format!("load '{}' is not FILE:PARTNUMBER", spec))
        })
        .collect::<Result<Vec<_>>>()?;

    let loader = DataLoader::new();
    let handle = loader.create_handler()?;
    loader.set_target_hardware_id(handle, &args.id)?;
    loader.set_target_hardware_ip(handle, args.ip)?;
    loader.set_target_hardware_pos(handle, &args.pos)?;
    loader.set_load_list(handle, loads)?;

    if let Some(path) = &args.cert {
        let cert = Certificate::from_file(path)
            .with_context(|| format!("reading certificate {}", path.display()))?;
        loader.set_certificate(handle, cert)?;
    }
    if let Some(port) = args.target_port {
        loader.set_tftp_targethardware_server_port(handle, port)?;
    }
    if let Some(port) = args.dataloader_port {
        loader.set_tftp_dataloader_server_port(handle, port)?;
    }
    if args.skip_missing {
        loader.set_file_not_available_policy(handle, FileNotAvailablePolicy::Skip)?;
    }
    if args.block_timeout.is_some() || args.max_retries.is_some() {
        let mut cfg = TransferConfig::default();
        if let Some(timeout) = args.block_timeout {
            cfg.timeout = timeout;
        }
        if let Some(retries) = args.max_retries {
            cfg.max_retries = retries;
        }
        loader.set_transfer_config(handle, cfg)?;
    }
    if let Some(timeout) = args.status_timeout {
        loader.set_status_timeout(handle, timeout)?;
    }

    let (tx, rx) = mpsc::channel();

    let init_tx = Mutex::new(tx.clone());
    loader.register_upload_initialization_response_callback(handle, move |_, response| {
        if response.is_accepted() {
            info!("target accepted the upload");
        } else {
            error!(
                "target denied the upload ({})",
                code_with_description(
                    response.operation_acceptance_status_code,
                    response.status_description.as_deref(),
                )
            );
            let _ = init_tx.lock().unwrap().send((
                response.operation_acceptance_status_code,
                response.status_description.clone(),
            ));
        }
    })?;

    loader.register_file_not_available_callback(handle, |_, file_name| {
        warn!("target requested unavailable file {}", file_name);
    })?;

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            .expect("static template"),
    );

    let tx = Mutex::new(tx);
    let status_bar = bar.clone();
    loader.register_upload_information_status_callback(handle, move |_, status| {
        status_bar.set_position(status.percent_completed as u64);
        if let Some(load) = &status.current_load {
            status_bar.set_message(load.clone());
        }
        if status.is_terminal() {
            let _ = tx
                .lock()
                .unwrap()
                .send((status.upload_operation_status_code, status
                    .upload_status_description
                    .clone()));
        }
    })?;

    info!(
        "uploading to {} position {} at {}",
        args.id, args.pos, args.ip
    );
    loader.upload(handle)?;

    let outcome = rx.recv();
    bar.finish_and_clear();
    loader.destroy_handler(handle)?;

    match outcome {
        Ok((STATUS_UPLOAD_COMPLETED, _)) => {
            info!("upload completed");
            Ok(true)
        }
        Ok((code, description)) => {
            error!(
                "upload ended with status {}",
                code_with_description(code, description.as_deref())
            );
            Ok(false)
        }
        Err(_) => {
            // Worker ended without a terminal status: initialization
            // was rejected or failed before the transfer phase.
            error!("upload did not reach the transfer phase");
            Ok(false)
        }
    }
}

/// Status code with its optional description, e.g. "0x1007: no space".
fn code_with_description(code: u16, description: Option<&str>) -> String {
    match description {
        Some(text) => format!("{:#06x}: {}", code, text),
        None => format!("{:#06x}", code),
    }
}
