use std::fmt::Display;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

/// Pause before a failed worker is started again.
pub const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Run `work` on a named thread under a supervisor. `work` returning `Ok`
/// ends the worker; an `Err` is logged and the worker is restarted after
/// [`RESTART_BACKOFF`]. Nothing is restarted once `shutdown` is raised.
pub fn spawn<F, E>(name: &str, shutdown: Arc<AtomicBool>, mut work: F) -> io::Result<JoinHandle<()>>
where
    F: FnMut() -> Result<(), E> + Send + 'static,
    E: Display,
{
    let label = name.to_string();
    thread::Builder::new().name(label.clone()).spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            match work() {
                Ok(()) => break,
                Err(err) => {
                    error!(worker = %label, error = %err, "worker failed, restarting");
                    sleep_unless(&shutdown, RESTART_BACKOFF);
                }
            }
        }
        debug!(worker = %label, "worker stopped");
    })
}

/// Sleep for `duration` in short steps, returning early on shutdown.
pub fn sleep_unless(shutdown: &AtomicBool, duration: Duration) {
    const STEP: Duration = Duration::from_millis(20);
    let mut left = duration;
    while !left.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let step = left.min(STEP);
        thread::sleep(step);
        left -= step;
    }
}
