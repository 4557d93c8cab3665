// DRIVER
// OWNS THE TimeoutTable AND THE IdleWatcher, RUNS THE OUTER LOOP, AND
// COORDINATES STOP/RESUME/RESTART THROUGH THE SIGNAL FLAGS BELOW.
//
// THE C ORIGINAL LONG-JUMPS OUT OF SIGNAL HANDLERS TO ABANDON AN IN-PROGRESS
// BLOCKING WAIT. THIS CRATE REPLACES THAT WITH THE FLAG-BASED PATTERN SPEC'D
// IN THE DESIGN NOTES: HANDLERS ONLY TOUCH THESE ATOMICS, AND
// IdleWatcher::wait's EINTR PATH RETURNS `Interrupted` SO THE LOOP BELOW CAN
// REACT WITHOUT ANY NON-LOCAL CONTROL FLOW.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::WatchdogError;
use crate::idle::{IdleWatcher, WaitOutcome};
use crate::timeouts::TimeoutTable;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);
static CONT_REQUESTED: AtomicBool = AtomicBool::new(false);
static RESTART_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigtstp(_signum: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigcont(_signum: libc::c_int) {
    CONT_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigalrm(_signum: libc::c_int) {
    RESTART_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_handler(signum: libc::c_int, handler: extern "C" fn(libc::c_int)) {
    // SAFETY: sa is fully initialized before being passed to sigaction, and
    // handler has the `extern "C" fn(c_int)` signature sigaction expects.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_ONSTACK | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, ptr::null_mut());
    }
}

/// Installs the SIGTSTP/SIGCONT/SIGALRM handlers. `SIGSTOP` cannot be
/// caught (POSIX forbids a handler for it); see SPEC_FULL.md §5 for why
/// that gap is accepted rather than worked around.
pub fn install_signal_handlers() {
    install_handler(libc::SIGTSTP, on_sigtstp);
    install_handler(libc::SIGCONT, on_sigcont);
    install_handler(libc::SIGALRM, on_sigalrm);
}

#[derive(Default)]
struct DriverState {
    prev_threshold: u32,
    last_threshold: u32,
    restart: bool,
}

/// What `Driver` needs from an idle watcher. `IdleWatcher` is the only real
/// implementation; tests substitute a fake so the loop in `run()` can be
/// exercised without a display server.
pub trait IdleSource {
    fn wait(&mut self, timeout_secs: u32) -> Result<WaitOutcome, WatchdogError>;
    fn reset(&mut self) -> Result<(), WatchdogError>;
}

impl IdleSource for IdleWatcher {
    fn wait(&mut self, timeout_secs: u32) -> Result<WaitOutcome, WatchdogError> {
        IdleWatcher::wait(self, timeout_secs)
    }

    fn reset(&mut self) -> Result<(), WatchdogError> {
        IdleWatcher::reset(self)
    }
}

pub struct Driver<W: IdleSource = IdleWatcher> {
    table: TimeoutTable,
    watcher: Option<W>,
    state: DriverState,
    reconnect: Box<dyn Fn() -> Result<W, WatchdogError>>,
}

impl Driver<IdleWatcher> {
    pub fn new(table: TimeoutTable) -> Result<Self, WatchdogError> {
        install_signal_handlers();
        let watcher = IdleWatcher::connect()?;
        Ok(Self {
            table,
            watcher: Some(watcher),
            state: DriverState::default(),
            reconnect: Box::new(IdleWatcher::connect),
        })
    }
}

impl<W: IdleSource> Driver<W> {
    /// Builds a driver around an already-connected source and a factory used
    /// to rebuild one after a SIGTSTP/SIGCONT cycle. Exposed outside of
    /// `#[cfg(test)]` so integration tests in `tests/` can drive the loop in
    /// `run()` against a fake, not because production code calls it.
    pub fn with_source(
        table: TimeoutTable,
        watcher: W,
        reconnect: impl Fn() -> Result<W, WatchdogError> + 'static,
    ) -> Self {
        Self { table, watcher: Some(watcher), state: DriverState::default(), reconnect: Box::new(reconnect) }
    }

    /// Runs the watchdog until a fatal error occurs. Never returns `Ok` in
    /// normal operation; this only returns once the watcher reports a hard
    /// `Error` (spec §4.4/§7).
    pub fn run(&mut self) -> Result<(), WatchdogError> {
        loop {
            self.service_signals()?;

            if self.state.restart {
                self.fire_state_reset();
            }

            self.state.prev_threshold = self.state.last_threshold;
            self.state.last_threshold = self.table.next(self.state.prev_threshold).unwrap_or(0);

            let outcome = {
                let watcher = self
                    .watcher
                    .as_mut()
                    .expect("watcher is only absent while suspended, and we never wait then");
                watcher.wait(self.state.last_threshold)
            };

            match outcome {
                Err(err) => return Err(err),
                Ok(WaitOutcome::Interrupted) => continue,
                Ok(WaitOutcome::Timeout) => {
                    if self.state.last_threshold != 0 {
                        self.table.exec_range(self.state.prev_threshold, self.state.last_threshold);
                    }
                }
                Ok(WaitOutcome::Unidle) => {
                    self.fire_state_reset();
                }
            }
        }
    }

    fn fire_state_reset(&mut self) {
        self.table.exec_reset();
        self.state.prev_threshold = 0;
        self.state.last_threshold = 0;
        self.state.restart = false;
    }

    /// Checks the signal flags once per loop iteration and acts on them:
    /// SIGTSTP tears the watcher down and blocks until SIGCONT, then
    /// rebuilds it; SIGALRM resyncs the existing watcher in place. Both
    /// request a soft restart of `DriverState` on the next iteration.
    fn service_signals(&mut self) -> Result<(), WatchdogError> {
        if STOP_REQUESTED.swap(false, Ordering::SeqCst) {
            tracing::info!("SIGTSTP received, releasing display connection");
            self.watcher = None;
            // SAFETY: raise() with the default action restored is how we
            // actually suspend -- re-raising SIGTSTP with SIG_DFL installed
            // lets the kernel stop this process for real.
            unsafe {
                let mut default_action: libc::sigaction = std::mem::zeroed();
                default_action.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(libc::SIGTSTP, &default_action, ptr::null_mut());
                libc::raise(libc::SIGTSTP);
            }
            install_handler(libc::SIGTSTP, on_sigtstp);

            while !CONT_REQUESTED.swap(false, Ordering::SeqCst) {
                // SAFETY: pause() blocks until any signal is delivered.
                unsafe {
                    libc::pause();
                }
            }

            tracing::info!("SIGCONT received, reconnecting to the display");
            self.watcher = Some((self.reconnect)()?);
            self.state.restart = true;
        }

        if RESTART_REQUESTED.swap(false, Ordering::SeqCst) {
            tracing::info!("SIGALRM received, resyncing idle watcher");
            if let Some(watcher) = self.watcher.as_mut() {
                watcher.reset()?;
            }
            self.state.restart = true;
        }

        Ok(())
    }
}
