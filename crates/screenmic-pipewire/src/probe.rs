//! PipeWire availability probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use pipewire::context::ContextRc;
use pipewire::main_loop::MainLoopRc;
use tracing::{debug, warn};

use crate::error::{PwError, PwResult};

/// Set once a probe has succeeded; later probes answer from here.
static AVAILABLE: AtomicBool = AtomicBool::new(false);

/// Check whether a PipeWire server accepts connections.
///
/// The connection attempt runs on a throwaway thread and is abandoned after
/// `timeout`. Never panics and has no lasting side effects; a positive answer
/// is cached for the lifetime of the process.
#[must_use]
pub fn has_pipewire(timeout: Duration) -> bool {
    if AVAILABLE.load(Ordering::Acquire) {
        return true;
    }

    let (tx, rx) = std_mpsc::sync_channel(1);

    let spawned = std::thread::Builder::new().name("pipewire-probe".to_string()).spawn(move || {
        let _ = tx.try_send(try_connect());
    });

    if let Err(e) = spawned {
        warn!(error = %e, "Failed to spawn probe thread");
        return false;
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(())) => {
            AVAILABLE.store(true, Ordering::Release);
            true
        }
        Ok(Err(e)) => {
            debug!(error = %e, "PipeWire not available");
            false
        }
        Err(_) => {
            debug!(?timeout, "PipeWire probe timed out");
            false
        }
    }
}

fn try_connect() -> PwResult<()> {
    pipewire::init();

    let main_loop = MainLoopRc::new(None)
        .map_err(|e| PwError::MainLoopError(format!("Failed to create main loop: {e}")))?;
    let context = ContextRc::new(&main_loop, None)
        .map_err(|e| PwError::ConnectionFailed(format!("Failed to create context: {e}")))?;
    let _core = context
        .connect_rc(None)
        .map_err(|e| PwError::ConnectionFailed(format!("Failed to connect: {e}")))?;

    Ok(())
}
