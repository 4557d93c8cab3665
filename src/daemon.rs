// DAEMONIZER
// DOUBLE-FORK + SESSION-LEADER DETACH, THEN exec /bin/sh -c <cmd>.
// THE CALLER ONLY EVER SEES THE INTERMEDIATE CHILD REAPED; THE GRANDCHILD
// RUNS FULLY DETACHED AND IS NEVER WAITED ON AGAIN.

use std::ffi::CString;
use std::io;

use crate::error::WatchdogError;

/// Launches `/bin/sh -c <cmd>` fully detached from the caller.
pub fn spawn_detached(cmd: &str) -> Result<(), WatchdogError> {
    let cmd = CString::new(cmd).map_err(|_| WatchdogError::InvalidArg(
        "command contains an interior NUL byte".into(),
    ))?;

    // SAFETY: fork() has no preconditions; the branches below each touch only
    // async-signal-safe state (no allocation on the child-only paths after the
    // second fork, except the final execl which replaces the image entirely).
    let first_pid = unsafe { libc::fork() };
    if first_pid < 0 {
        return Err(WatchdogError::ForkFailure);
    }

    if first_pid > 0 {
        // PARENT: REAP THE INTERMEDIATE CHILD SO NO ZOMBIE LINGERS.
        let mut status = 0;
        // SAFETY: first_pid is the pid just returned by fork() above.
        let res = unsafe { libc::waitpid(first_pid, &mut status, 0) };
        if res < 0 {
            return Err(WatchdogError::ForkFailure);
        }
        return Ok(());
    }

    // INTERMEDIATE CHILD. BECOME A SESSION LEADER SO THE GRANDCHILD CANNOT
    // REACQUIRE A CONTROLLING TERMINAL, AND IGNORE THE SIGNALS THAT WOULD
    // OTHERWISE FOLLOW IT AROUND (SIGCHLD/SIGHUP) ONCE WE EXIT.
    // SAFETY: setsid() is async-signal-safe; we are single-threaded here.
    if unsafe { libc::setsid() } < 0 {
        // SAFETY: _exit is async-signal-safe and does not return.
        unsafe { libc::_exit(1) };
    }
    // SAFETY: signal() with SIG_IGN installs the default ignore action.
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // SAFETY: second fork, same preconditions as the first.
    let second_pid = unsafe { libc::fork() };
    if second_pid < 0 {
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(1) };
    }
    if second_pid > 0 {
        // INTERMEDIATE CHILD EXITS IMMEDIATELY; PARENT HAS ALREADY WAITPID'D IT.
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(0) };
    }

    // GRANDCHILD: RESET UMASK, CLOSE EVERYTHING EXCEPT STDOUT/STDERR (THE
    // ADMINISTRATOR MAY WANT TO SEE COMMAND OUTPUT IN THE PARENT'S TERMINAL),
    // THEN EXEC. NEVER RETURNS ON SUCCESS.
    // SAFETY: umask() is async-signal-safe.
    unsafe { libc::umask(0) };
    close_inherited_fds();

    let sh = CString::new("/bin/sh").expect("static string has no NUL");
    let flag = CString::new("-c").expect("static string has no NUL");
    let argv = [sh.as_ptr(), flag.as_ptr(), cmd.as_ptr(), std::ptr::null()];
    // SAFETY: argv is NUL-terminated and each CString outlives this call.
    unsafe { libc::execv(sh.as_ptr(), argv.as_ptr()) };

    // execv only returns on failure.
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(1);
    // SAFETY: _exit is async-signal-safe.
    unsafe { libc::_exit(errno) };
}

fn close_inherited_fds() {
    // SAFETY: sysconf is async-signal-safe and takes no pointers.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let max_fd = if max_fd > 0 { max_fd } else { 1024 };
    for fd in 0..max_fd as i32 {
        if fd == libc::STDOUT_FILENO || fd == libc::STDERR_FILENO {
            continue;
        }
        // SAFETY: close() on an fd we don't own is a no-op (returns EBADF);
        // closing one we do own is exactly the intended cleanup.
        unsafe { libc::close(fd) };
    }
}
