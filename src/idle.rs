// IDLE WATCHER
// OWNS THE X11 CONNECTION, THE IDLETIME COUNTER HANDLE, AND THE TWO ALARMS
// (zero_alarm FOR NEGATIVE-TRANSITION-THROUGH-0, timeout_alarm FOR
// POSITIVE-TRANSITION-THROUGH-A-CONFIGURED-VALUE). TRANSLATES THE RAW
// COUNTER/ALARM PROTOCOL INTO THE THREE-VALUED wait() OUTCOME THE DRIVER
// CONSUMES.

use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

use x11rb::connection::Connection;
use x11rb::protocol::sync::{
    Alarm, ChangeAlarmAux, ConnectionExt as _, Counter, CreateAlarmAux, Int64, TestType,
    ValueType,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

use crate::error::WatchdogError;

const IDLETIME_COUNTER_NAME: &[u8] = b"IDLETIME";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Reset,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The user has just become active again.
    Unidle,
    /// The armed threshold was crossed.
    Timeout,
    /// The blocking wait was interrupted by a signal; no event was consumed.
    Interrupted,
}

fn ms_to_int64(ms: i64) -> Int64 {
    Int64 { hi: (ms >> 32) as i32, lo: (ms & 0xFFFF_FFFF) as u32 }
}

fn int64_to_ms(v: Int64) -> i64 {
    ((v.hi as i64) << 32) | (v.lo as u32 as i64)
}

/// Absolute counter value at which `timeout_secs` should fire. When the
/// counter was already non-trivial at connect time (`base_timer > 1000`,
/// the mid-idle-start case) the trigger is offset by that base so a
/// process that starts while the user is already idle still measures each
/// threshold from its own baseline instead of from zero. See spec §4.3 and
/// scenario S5.
fn timeout_deadline_ms(base_timer: i64, timeout_secs: u32) -> i64 {
    if base_timer > 1000 {
        base_timer + timeout_secs as i64 * 1000
    } else {
        timeout_secs as i64 * 1000
    }
}

pub struct IdleWatcher {
    conn: RustConnection,
    #[allow(dead_code)]
    idle_counter: Counter,
    zero_alarm: Alarm,
    timeout_alarm: Alarm,
    base_timer: i64,
    state: WatcherState,
}

impl IdleWatcher {
    /// Opens the default display, checks for the SYNC extension and the
    /// IDLETIME counter, and creates both alarms disabled. See spec §4.3.
    pub fn connect() -> Result<Self, WatchdogError> {
        let (conn, _screen_num) = RustConnection::connect(None).map_err(|_| WatchdogError::NoDisplay)?;

        conn.sync_initialize(1, 0)
            .map_err(|_| WatchdogError::NoSync)?
            .reply()
            .map_err(|_| WatchdogError::NoSync)?;

        let counters = conn.sync_list_system_counters()?.reply()?;
        let idle_counter = counters
            .counters
            .into_iter()
            .find(|c| c.name == IDLETIME_COUNTER_NAME)
            .ok_or(WatchdogError::NoIdleCounter)?
            .counter;

        let value = conn.sync_query_counter(idle_counter)?.reply()?.value;
        let base_timer = int64_to_ms(value);
        if base_timer < 0 {
            return Err(WatchdogError::BadCounter);
        }

        let zero_alarm = conn.generate_id().map_err(|_| WatchdogError::AlarmFailure)?;
        let zero_aux = CreateAlarmAux::new()
            .counter(idle_counter)
            .value_type(ValueType::ABSOLUTE)
            .value(ms_to_int64(0))
            .test_type(TestType::NEGATIVE_TRANSITION)
            .delta(ms_to_int64(0))
            .events(0u32);
        conn.sync_create_alarm(zero_alarm, &zero_aux)
            .map_err(|_| WatchdogError::AlarmFailure)?
            .check()
            .map_err(|_| WatchdogError::AlarmFailure)?;

        let timeout_alarm = conn.generate_id().map_err(|_| WatchdogError::AlarmFailure)?;
        let timeout_aux = CreateAlarmAux::new()
            .counter(idle_counter)
            .value_type(ValueType::ABSOLUTE)
            .value(ms_to_int64(0))
            .test_type(TestType::POSITIVE_TRANSITION)
            .delta(ms_to_int64(0))
            .events(0u32);
        conn.sync_create_alarm(timeout_alarm, &timeout_aux)
            .map_err(|_| WatchdogError::AlarmFailure)?
            .check()
            .map_err(|_| WatchdogError::AlarmFailure)?;

        conn.flush()?;

        Ok(Self {
            conn,
            idle_counter,
            zero_alarm,
            timeout_alarm,
            base_timer,
            state: WatcherState::Reset,
        })
    }

    /// Blocks until activity resumes or `timeout_secs` elapses. `timeout_secs ==
    /// 0` in `Timeout` state means "wait for activity only". See spec §4.3.
    pub fn wait(&mut self, timeout_secs: u32) -> Result<WaitOutcome, WatchdogError> {
        match self.state {
            WatcherState::Reset => self.wait_reset(timeout_secs),
            WatcherState::Timeout => self.wait_timeout(timeout_secs),
        }
    }

    fn wait_reset(&mut self, timeout_secs: u32) -> Result<WaitOutcome, WatchdogError> {
        loop {
            if self.base_timer > 1000 {
                self.arm_zero_alarm()?;
            }
            self.arm_timeout_alarm(timeout_deadline_ms(self.base_timer, timeout_secs))?;

            match self.drain_until_alarm()? {
                AlarmFired::Zero => {
                    self.base_timer = 0;
                    self.disable_alarms()?;
                    // RETRY: REARM WITH THE FRESH BASE. MATCHES THE SOURCE'S
                    // `goto start` IN wait_reset().
                    continue;
                }
                AlarmFired::Timeout => {
                    self.disable_alarms()?;
                    self.state = WatcherState::Timeout;
                    return Ok(WaitOutcome::Timeout);
                }
                AlarmFired::Interrupted => {
                    self.disable_alarms()?;
                    return Ok(WaitOutcome::Interrupted);
                }
            }
        }
    }

    fn wait_timeout(&mut self, timeout_secs: u32) -> Result<WaitOutcome, WatchdogError> {
        self.arm_zero_alarm()?;
        if timeout_secs > 0 {
            self.arm_timeout_alarm(timeout_deadline_ms(self.base_timer, timeout_secs))?;
        }

        match self.drain_until_alarm()? {
            AlarmFired::Zero => {
                self.base_timer = 0;
                self.disable_alarms()?;
                self.state = WatcherState::Reset;
                Ok(WaitOutcome::Unidle)
            }
            AlarmFired::Timeout => {
                self.disable_alarms()?;
                Ok(WaitOutcome::Timeout)
            }
            AlarmFired::Interrupted => {
                self.disable_alarms()?;
                Ok(WaitOutcome::Interrupted)
            }
        }
    }

    fn drain_until_alarm(&self) -> Result<AlarmFired, WatchdogError> {
        loop {
            let event = match self.next_event() {
                Ok(event) => event,
                Err(WatchdogError::Interrupted) => return Ok(AlarmFired::Interrupted),
                Err(err) => return Err(err),
            };

            let Event::SyncAlarmNotify(notify) = event else {
                continue;
            };

            if notify.alarm == self.zero_alarm {
                return Ok(AlarmFired::Zero);
            }
            if notify.alarm == self.timeout_alarm {
                return Ok(AlarmFired::Timeout);
            }
        }
    }

    /// Blocks on the connection fd with a signal-aware `ppoll` whenever no
    /// event is already queued, mirroring the source's `XPending`+`pselect`
    /// loop. No wall-clock timeout: the alarms provide the timing.
    fn next_event(&self) -> Result<Event, WatchdogError> {
        loop {
            if let Some(event) = self.conn.poll_for_event()? {
                return Ok(event);
            }
            self.conn.flush()?;

            let mut pfd = libc::pollfd {
                fd: self.conn.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: pfd is a single valid pollfd backed by the connection's
            // own fd; ppoll blocks with no timeout (NULL) and no signal mask
            // override (NULL), so it returns on readability or any signal.
            let ret = unsafe { libc::ppoll(&mut pfd, 1, ptr::null(), ptr::null()) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Err(WatchdogError::Interrupted);
                }
                return Err(WatchdogError::Connection(x11rb::errors::ConnectionError::IoError(err)));
            }
        }
    }

    fn arm_zero_alarm(&self) -> Result<(), WatchdogError> {
        let aux = ChangeAlarmAux::new().events(1u32);
        self.conn
            .sync_change_alarm(self.zero_alarm, &aux)
            .map_err(|_| WatchdogError::AlarmFailure)?
            .check()
            .map_err(|_| WatchdogError::AlarmFailure)
    }

    fn arm_timeout_alarm(&self, absolute_ms: i64) -> Result<(), WatchdogError> {
        let aux = ChangeAlarmAux::new()
            .value_type(ValueType::ABSOLUTE)
            .value(ms_to_int64(absolute_ms))
            .test_type(TestType::POSITIVE_TRANSITION)
            .delta(ms_to_int64(0))
            .events(1u32);
        self.conn
            .sync_change_alarm(self.timeout_alarm, &aux)
            .map_err(|_| WatchdogError::AlarmFailure)?
            .check()
            .map_err(|_| WatchdogError::AlarmFailure)
    }

    fn disable_alarms(&self) -> Result<(), WatchdogError> {
        let aux = ChangeAlarmAux::new().events(0u32);
        self.conn
            .sync_change_alarm(self.zero_alarm, &aux)
            .map_err(|_| WatchdogError::AlarmFailure)?
            .check()
            .map_err(|_| WatchdogError::AlarmFailure)?;
        self.conn
            .sync_change_alarm(self.timeout_alarm, &aux)
            .map_err(|_| WatchdogError::AlarmFailure)?
            .check()
            .map_err(|_| WatchdogError::AlarmFailure)?;
        self.conn.sync()?;
        Ok(())
    }

    /// Re-reads the counter and forces `Reset` state without tearing down the
    /// connection. Used by the Driver's SIGALRM soft-restart path.
    pub fn reset(&mut self) -> Result<(), WatchdogError> {
        self.disable_alarms()?;
        let value = self.conn.sync_query_counter(self.idle_counter)?.reply()?.value;
        self.base_timer = int64_to_ms(value).max(0);
        self.state = WatcherState::Reset;
        Ok(())
    }

    /// Disables both alarms and flushes the connection. Safe to call more
    /// than once; the connection itself is released on drop.
    pub fn close(&mut self) {
        if let Err(err) = self.disable_alarms() {
            tracing::warn!(error = %err, "error while closing idle watcher");
        }
    }
}

impl Drop for IdleWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

enum AlarmFired {
    Zero,
    Timeout,
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int64_round_trips_through_hi_lo_halves() {
        let ms: i64 = 12_345_678_901;
        assert_eq!(int64_to_ms(ms_to_int64(ms)), ms);
    }

    #[test]
    fn int64_round_trips_zero() {
        assert_eq!(int64_to_ms(ms_to_int64(0)), 0);
    }

    #[test]
    fn deadline_ignores_base_timer_when_fresh() {
        // base_timer <= 1000ms: the process started near-idle, so the
        // deadline is just the threshold in ms.
        assert_eq!(timeout_deadline_ms(0, 5), 5_000);
        assert_eq!(timeout_deadline_ms(1000, 10), 10_000);
    }

    #[test]
    fn deadline_offsets_by_base_timer_mid_idle_start() {
        // base_timer > 1000ms: scenario S5, mid-idle start.
        assert_eq!(timeout_deadline_ms(8_000, 5), 13_000);
        assert_eq!(timeout_deadline_ms(8_000, 10), 18_000);
    }
}
