//! SOS button input.
//!
//! The button is exposed as a sysfs GPIO value file (`0` released, `1`
//! pressed). A released→pressed edge raises a manual SOS; holding the button
//! does not repeat it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::pipeline::BusEvent;

pub async fn read_level(path: &Path) -> std::io::Result<bool> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(text.trim() == "1")
}

pub struct SosInput {
    path: PathBuf,
    poll: Duration,
}

impl SosInput {
    pub fn new(path: PathBuf, poll: Duration) -> Self {
        Self { path, poll }
    }

    pub async fn run(self, bus: mpsc::Sender<BusEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last: Option<bool> = None;
        let mut failing = false;

        info!(path = %self.path.display(), "Watching SOS input");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            match read_level(&self.path).await {
                Ok(pressed) => {
                    if failing {
                        info!("SOS input readable again");
                        failing = false;
                    }
                    if pressed && last == Some(false) && bus.send(BusEvent::ManualSos).await.is_err() {
                        break;
                    }
                    last = Some(pressed);
                }
                Err(e) => {
                    if !failing {
                        warn!(error = %e, path = %self.path.display(), "Cannot read SOS input");
                        failing = true;
                    }
                    last = None;
                }
            }
        }

        debug!("SOS input stopped");
    }
}
