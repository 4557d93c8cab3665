// CLI SURFACE
//
// `-h`/`--help` and `-v`/`--version` are ordinary clap flags. The timeout
// positionals (`N:cmd`, `reset:cmd`) are deliberately NOT modeled as a typed
// clap value parser: the grammar couples a numeric threshold, a `reset:`
// sigil, and arbitrary trailing command text in a way that's closer to a
// small domain-specific parser than a CLI flag, and routing it through
// `clap::value_parser!` would bury `TimeoutTable` construction -- the part
// the spec actually centers -- inside argument-parsing plumbing. So clap
// only owns the flags; `parse_positionals` owns the grammar.

use clap::Parser;

use crate::error::WatchdogError;
use crate::timeouts::TimeoutTable;

/// Maximum threshold in whole seconds: `N * 1000` must fit in an i64 delta
/// against the SYNC counter, and the original bounds it at u32::MAX / 1000.
pub const MAX_THRESHOLD_SECS: u32 = u32::MAX / 1000;

#[derive(Parser, Debug)]
#[command(name = "xs-timeout", version, about = "Runs commands at X11 idle thresholds")]
struct Cli {
    /// `N:cmd` registers `cmd` to run at `N` seconds idle; `reset:cmd`
    /// registers `cmd` to run once activity resumes after a timeout fired.
    #[arg(value_name = "N:CMD|reset:CMD")]
    timeouts: Vec<String>,
}

pub enum ParsedArgs {
    /// `-h`/`--help` or `-v`/`--version` already printed their output; the
    /// caller should exit 0 without building a `Driver`.
    ShowedInfo,
    Table(TimeoutTable),
}

/// Parses `std::env::args()` into a populated `TimeoutTable`, or signals
/// that help/version text was already printed. See spec §4.5/§6.
pub fn parse_args() -> Result<ParsedArgs, WatchdogError> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == clap::error::ErrorKind::DisplayHelp
            || err.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            // clap has already written the text to stdout.
            print!("{err}");
            return Ok(ParsedArgs::ShowedInfo);
        }
        Err(err) => return Err(WatchdogError::InvalidArg(err.to_string())),
    };

    if cli.timeouts.is_empty() {
        use clap::CommandFactory;
        return Err(WatchdogError::InvalidArg(format!(
            "No timeouts found\n{}",
            Cli::command().render_usage(),
        )));
    }

    let mut table = TimeoutTable::new();
    for token in &cli.timeouts {
        let (threshold, cmd) = parse_positional(token)?;
        table.append(threshold, cmd);
    }

    Ok(ParsedArgs::Table(table))
}

/// Parses one `N:cmd` or `reset:cmd` token. Mirrors `oparse_timeout` from
/// the original implementation: trims leading whitespace off `cmd`, and
/// rejects an out-of-range or non-numeric `N` or an empty `cmd`.
fn parse_positional(token: &str) -> Result<(u32, String), WatchdogError> {
    let (key, cmd) = token
        .split_once(':')
        .ok_or_else(|| WatchdogError::InvalidArg(format!("'{token}' is not a valid timeout")))?;

    let cmd = cmd.trim_start().to_string();
    if cmd.is_empty() {
        return Err(WatchdogError::InvalidArg(format!("'{token}' has no command")));
    }

    if key == "reset" {
        return Ok((0, cmd));
    }

    let threshold: u32 = key
        .parse()
        .map_err(|_| WatchdogError::InvalidArg(format!("'{token}' is not a valid timeout")))?;

    if threshold == 0 || threshold > MAX_THRESHOLD_SECS {
        return Err(WatchdogError::InvalidArg(format!("'{token}' is not a valid timeout")));
    }

    Ok((threshold, cmd))
}
