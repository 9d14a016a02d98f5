use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use aifscli::command::{self, Command};
use aifscli::config::ConfigLoad;
use aifscli::trace;

#[derive(Debug, Parser)]
#[command(version, author, about = "AIFS storage engine CLI")]
pub struct Args {
    #[clap(short, long, help = "debug mode")]
    debug: bool,

    /// Configuration file path.
    #[clap(short = 'c', long = "config", default_value = "config/aifs.toml")]
    config: String,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    /// The subcommand to run.
    #[clap(subcommand)]
    cmd: Command,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!(
        "{}/.aifscli",
        std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
    );
    let _log_guard = trace::init(&log_dir, &args.log_level)?;
    info!("aifscli start args: {:?}", &args);

    let cfg: ConfigLoad = match confy::load_path(&args.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            log::warn!("config {:?} not usable ({}), using defaults", args.config, err);
            ConfigLoad::default()
        }
    };
    if args.debug {
        println!("{:?}", &cfg);
    }
    info!("aifscli start config: {:?}", &cfg);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        eprintln!("received Ctrl+C!");
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    command::run(args.cmd, &cfg)
}
