// ERROR TAXONOMY FOR THE WATCHDOG
// ONE VARIANT PER FAILURE MODE DESCRIBED BY THE INIT/WAIT CONTRACTS BELOW.
// INIT-TIME VARIANTS ARE ALWAYS FATAL; Interrupted IS THE ONE THAT UNWINDS
// TO THE Driver INSTEAD OF TO main().

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("cannot connect to display server")]
    NoDisplay,

    #[error("X server does not support the SYNC extension")]
    NoSync,

    #[error("IDLETIME system counter not found")]
    NoIdleCounter,

    #[error("IDLETIME counter reports a negative value")]
    BadCounter,

    #[error("failed to create or arm an X SYNC alarm")]
    AlarmFailure,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("blocking wait was interrupted by a signal")]
    Interrupted,

    #[error("failed to fork a detached child")]
    ForkFailure,

    #[error("X11 connection error")]
    Connection(#[from] x11rb::errors::ConnectionError),

    #[error("X11 reply error")]
    Reply(#[from] x11rb::errors::ReplyError),
}
