use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use clap::Parser;
use pose_relay::{
    config::{Cli, Command},
    pipeline, server,
};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = stop.clone();
    ctrlc::set_handler(move || {
        log::info!("interrupt received, shutting down");
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install interrupt handler")?;

    match cli.command {
        Command::Stream(args) => pipeline::stream(&args, &stop),
        Command::Serve(args) => server::serve(&args, &stop),
    }
}
