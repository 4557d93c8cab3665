// xs-timeout -- X11 IDLE WATCHDOG
// PARSES CLI ARGS INTO A TimeoutTable, INSTALLS A TRACING SUBSCRIBER, THEN
// HANDS OFF TO THE Driver FOR THE LIFE OF THE PROCESS.

use xs_timeout::cli::{self, ParsedArgs};
use xs_timeout::driver::Driver;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(
            "warn".parse().expect("'warn' is a valid env-filter directive"),
        ))
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    std::process::exit(run());
}

fn run() -> i32 {
    let table = match cli::parse_args() {
        Ok(ParsedArgs::ShowedInfo) => return 0,
        Ok(ParsedArgs::Table(table)) => table,
        Err(err) => {
            tracing::error!("{err}");
            return 1;
        }
    };

    tracing::debug!(timeouts = %table.inspect(), "starting with parsed timeout table");

    let mut driver = match Driver::new(table) {
        Ok(driver) => driver,
        Err(err) => {
            tracing::error!("{err}");
            return 1;
        }
    };

    match driver.run() {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("{err}");
            1
        }
    }
}
