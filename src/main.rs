//! holyrood: DAB ensemble multiplexer.
//!
//! Reads the ensemble description, then produces one 6144-byte ETI(NI)
//! frame per 24 ms tick and distributes it to the configured ETI sinks and
//! EDI destinations. Pacing comes from the sinks: a `simul://` output
//! sleeps the loop onto the 24 ms grid, a FIFO or hardware-fed sink paces
//! by back-pressure.

mod config;
mod inputs;
mod mux;
mod outputs;
mod remote;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use config::ConfigFile;
use mux::DabMultiplexer;
use outputs::OutputGroup;

#[derive(Parser, Debug)]
#[command(version, about = "DAB ensemble multiplexer with ETI and EDI output")]
struct Args {
    /// Ensemble configuration file (YAML)
    config: PathBuf,
}

fn main() -> Result<()> {
    // log setup
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    colog::init();

    let args = Args::parse();

    let mux_config = ConfigFile::load(&args.config)?
        .build()
        .context("building ensemble from configuration")?;

    if mux_config.outputs.is_empty() && !mux_config.edi.enabled() {
        bail!("no outputs configured");
    }

    let mut outputs = OutputGroup::from_uris(&mux_config.outputs)?;
    let mut mux = DabMultiplexer::new(mux_config);
    mux.prepare()?;

    // The remote-control transport is an external collaborator; its
    // command queue is drained at every frame boundary.
    let (remote, queue) = remote::remote_channel();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })?;
    }

    info!("Starting the frame loop");
    while running.load(Ordering::SeqCst) && !mux.finished() {
        queue.drain(&mut mux);
        mux.mux_frame(&mut outputs)?;
    }

    // Final statistics snapshot, through the same path the monitoring
    // surface uses.
    let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
    remote.send(remote::RemoteCommand::GetValues(reply_tx));
    queue.drain(&mut mux);
    if let Ok(values) = reply_rx.try_recv() {
        info!("Statistics: {}", values);
    }

    info!("Shutting down after {} frames", mux.frames_muxed());
    Ok(())
}
