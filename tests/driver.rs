// END-TO-END DRIVER SCENARIOS
//
// DRIVES Driver<FakeWatcher> THROUGH THE SCENARIOS IN SPEC_FULL.md's
// TESTABLE-PROPERTIES SECTION (S1-S4). NO X11 SERVER IS INVOLVED --
// FakeWatcher REPLAYS A SCRIPTED SEQUENCE OF WaitOutcome VALUES, AND THE
// REAL TimeoutTable/daemon::spawn_detached MACHINERY DISPATCHES ACTUAL
// DETACHED SHELL COMMANDS SO THE ASSERTIONS EXERCISE THE WHOLE PATH FROM
// WaitOutcome DOWN TO A FILE APPEARING ON DISK.
//
// SCENARIO S5 (MID-IDLE START) IS A PROPERTY OF THE `base_timer > 1000`
// ARITHMETIC INSIDE IdleWatcher ITSELF, NOT OF THE DRIVER LOOP; IT'S COVERED
// BY THE UNIT TESTS IN src/idle.rs INSTEAD. SCENARIO S6 SPLITS ACROSS TWO
// PLACES: THE SIGALRM RESYNC HALF IS A src/driver.rs UNIT TEST, AND THE
// SIGTSTP/SIGCONT SUSPEND HALF ISN'T AUTOMATED AT ALL -- SEE THE NOTE AT
// THE BOTTOM OF THIS FILE.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use xs_timeout::driver::{Driver, IdleSource};
use xs_timeout::error::WatchdogError;
use xs_timeout::idle::WaitOutcome;
use xs_timeout::timeouts::TimeoutTable;

/// Replays a scripted sequence of outcomes; once exhausted, `wait` returns
/// an error so `Driver::run` unwinds instead of looping forever.
struct FakeWatcher {
    script: VecDeque<WaitOutcome>,
}

impl FakeWatcher {
    fn new(script: Vec<WaitOutcome>) -> Self {
        Self { script: script.into() }
    }
}

impl IdleSource for FakeWatcher {
    fn wait(&mut self, _timeout_secs: u32) -> Result<WaitOutcome, WatchdogError> {
        self.script.pop_front().ok_or(WatchdogError::NoDisplay)
    }

    fn reset(&mut self) -> Result<(), WatchdogError> {
        Ok(())
    }
}

fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("xs-timeout-test-{}-{}", std::process::id(), name))
}

fn touch_cmd(path: &Path) -> String {
    format!("touch {}", path.display())
}

fn append_cmd(path: &Path) -> String {
    format!("echo x >> {}", path.display())
}

fn wait_for(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    path.exists()
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
}

fn run_to_completion(table: TimeoutTable, script: Vec<WaitOutcome>) {
    let mut driver = Driver::with_source(table, FakeWatcher::new(script), || {
        Err(WatchdogError::NoDisplay)
    });
    // The fake always ends the script with an error, so run() always
    // returns Err here; that's the harness unwinding, not a real failure.
    assert!(driver.run().is_err());
}

#[test]
fn s1_basic_fire_dispatches_each_threshold_once() {
    let file_a = scratch_path("s1-a");
    let file_b = scratch_path("s1-b");
    let _ = std::fs::remove_file(&file_a);
    let _ = std::fs::remove_file(&file_b);

    let mut table = TimeoutTable::new();
    table.append(5, touch_cmd(&file_a));
    table.append(10, touch_cmd(&file_b));

    // Two loop iterations fire the two buckets; the third wait() call
    // finds the script exhausted and the driver returns.
    run_to_completion(table, vec![WaitOutcome::Timeout, WaitOutcome::Timeout]);

    assert!(wait_for(&file_a, Duration::from_secs(2)), "5s bucket did not fire");
    assert!(wait_for(&file_b, Duration::from_secs(2)), "10s bucket did not fire");
}

#[test]
fn s2_same_threshold_bucket_runs_every_command() {
    let file_x = scratch_path("s2-x");
    let file_y = scratch_path("s2-y");
    let _ = std::fs::remove_file(&file_x);
    let _ = std::fs::remove_file(&file_y);

    let mut table = TimeoutTable::new();
    table.append(5, touch_cmd(&file_x));
    table.append(5, touch_cmd(&file_y));

    run_to_completion(table, vec![WaitOutcome::Timeout]);

    assert!(wait_for(&file_x, Duration::from_secs(2)));
    assert!(wait_for(&file_y, Duration::from_secs(2)));
}

#[test]
fn s3_reset_bucket_fires_once_on_unidle() {
    let foo = scratch_path("s3-foo");
    let bar = scratch_path("s3-bar");
    let _ = std::fs::remove_file(&foo);
    let _ = std::fs::remove_file(&bar);

    let mut table = TimeoutTable::new();
    table.append(5, append_cmd(&foo));
    table.append(0, append_cmd(&bar));

    // Timeout fires `foo` at the 5s bucket, then Unidle fires the reset
    // bucket (`bar`) exactly once.
    run_to_completion(table, vec![WaitOutcome::Timeout, WaitOutcome::Unidle]);

    assert!(wait_for(&foo, Duration::from_secs(2)));
    assert!(wait_for(&bar, Duration::from_secs(2)));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(line_count(&bar), 1, "reset bucket must fire exactly once");
}

#[test]
fn s4_no_refire_without_intervening_unidle() {
    let foo = scratch_path("s4-foo");
    let _ = std::fs::remove_file(&foo);

    let mut table = TimeoutTable::new();
    table.append(5, append_cmd(&foo));

    // A single Timeout fires `foo`; the table has no further threshold
    // above 5, so `next()` yields 0 and the driver waits for activity only.
    // That call exhausts the script and ends the run.
    run_to_completion(table, vec![WaitOutcome::Timeout]);

    assert!(wait_for(&foo, Duration::from_secs(2)));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(line_count(&foo), 1, "must not refire without an intervening Unidle");
}

// S6 (suspend/resume) exercises `service_signals`'s SIGTSTP/SIGCONT branch,
// which is gated by process-wide signal flags private to `driver`. Raising
// a real SIGTSTP here would stop the whole test process, including whatever
// would send the matching SIGCONT, so that branch is covered from inside
// the module instead (see `src/driver.rs`'s own test module, which can set
// the flags directly without touching real signals).
