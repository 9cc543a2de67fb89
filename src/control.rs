//! Out-of-band control of the trading loop.
//!
//! The companion tasks here never touch trading state. They only flip an
//! atomic start/stop switch or raise the shutdown signal, both of which the
//! loop reads between pairs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shared start/stop flag
#[derive(Debug, Clone)]
pub struct TradingSwitch {
    running: Arc<AtomicBool>,
}

impl TradingSwitch {
    pub fn new(running: bool) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(running)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Set the flag, returning the previous value
    pub fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::SeqCst)
    }
}

impl Default for TradingSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Command read from the control file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
}

impl ControlCommand {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "start" | "/start" => Some(ControlCommand::Start),
            "stop" | "/stop" => Some(ControlCommand::Stop),
            _ => None,
        }
    }
}

/// Apply a command to the switch, logging real transitions
pub fn apply_command(switch: &TradingSwitch, command: ControlCommand) -> bool {
    let running = command == ControlCommand::Start;
    let was_running = switch.set_running(running);
    if was_running != running {
        if running {
            tracing::info!("▶️  Trading resumed by control command");
        } else {
            tracing::warn!("⏸️  Trading paused by control command");
        }
        return true;
    }
    false
}

/// Poll `path` for "start"/"stop" and mirror it into the switch
///
/// A missing or unreadable file leaves the switch untouched.
pub fn spawn_control_listener(
    path: PathBuf,
    switch: TradingSwitch,
    poll_interval: Duration,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }

            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    tracing::debug!("Control file {} unreadable: {}", path.display(), e);
                    continue;
                }
            };

            match ControlCommand::parse(&text) {
                Some(command) => {
                    apply_command(&switch, command);
                }
                None if !text.trim().is_empty() => {
                    tracing::debug!("Ignoring unknown control command {:?}", text.trim());
                }
                None => {}
            }
        }
        tracing::debug!("Control listener stopped");
    })
}

/// Cloneable shutdown signal
///
/// `trigger` is idempotent; `wait` resolves once it has been triggered,
/// including when it was triggered before the call.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&mut self) {
        // the sender lives in self, so the channel can not close under us
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
