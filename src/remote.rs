//! Remote-control plumbing: commands are queued by an external control
//! surface and drained by the timing loop between frames, never mid-frame.

use std::sync::mpsc::{channel, Receiver, Sender, SyncSender};

use log::warn;

use crate::mux::DabMultiplexer;

#[derive(Debug)]
pub enum RemoteCommand {
    /// Manual TAI-UTC override, `clocktai tai_utc_offset`.
    SetTaiOffset(i32),
    /// Pipe-separated bulletin URL list, triggers a reload.
    SetTaiUrls(String),
    /// Force the next AF sequence number (test support).
    OverrideAfSeq(u16),
    /// Force the next PFT Pseq (test support).
    OverridePftSeq(u16),
    /// Relabel a service; rejected if the resulting ensemble does not
    /// validate.
    SetServiceLabel {
        service_id: u32,
        label: String,
        short: Option<String>,
    },
    /// Switch an announcement cluster on or off.
    SetAnnouncement { cluster_id: u8, active: bool },
    /// Statistics snapshot.
    GetValues(SyncSender<serde_json::Value>),
}

#[derive(Clone)]
pub struct RemoteHandle {
    tx: Sender<RemoteCommand>,
}

impl RemoteHandle {
    pub fn send(&self, command: RemoteCommand) {
        if self.tx.send(command).is_err() {
            warn!("remote command dropped, multiplexer gone");
        }
    }
}

pub struct RemoteQueue {
    rx: Receiver<RemoteCommand>,
}

pub fn remote_channel() -> (RemoteHandle, RemoteQueue) {
    let (tx, rx) = channel();
    (RemoteHandle { tx }, RemoteQueue { rx })
}

impl RemoteQueue {
    /// Apply every queued command. Called once per frame boundary.
    pub fn drain(&self, mux: &mut DabMultiplexer) {
        while let Ok(command) = self.rx.try_recv() {
            mux.apply_remote(command);
        }
    }
}
