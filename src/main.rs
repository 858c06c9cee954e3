mod cache;
mod cancel;
mod format;
mod ring;
mod session;
mod spec;
mod writer;

use crate::cache::TracepointCache;
use crate::cancel::CancelToken;
use crate::session::Mode;
use crate::session::TracepointSession;
use crate::spec::TracepointSpec;
use crate::writer::TraceFileWriter;
use clap::Parser;
use eyre::Context;
use eyre::bail;
use eyre::eyre;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

mod cli {
    use std::path::PathBuf;

    #[derive(clap_derive::Parser)]
    #[command(version, about)]
    /// Collect Linux tracepoint events into a trace file
    pub struct Cli {
        /// Per-CPU buffer size in kilobytes (rounded up to a power of two)
        #[clap(short, long, default_value_t = 128,
               value_parser = clap::value_parser!(u64).range(1..=2_097_152))]
        pub buffersize: u64,
        /// Keep only the most recent events (write the file at shutdown)
        #[clap(short = 'c', long, conflicts_with = "realtime")]
        pub circular: bool,
        /// Write events to the file as they arrive (default)
        #[clap(short = 'C', long)]
        pub realtime: bool,
        /// File with one tracepoint spec per line (# comments and blank
        /// lines are skipped)
        #[clap(short, long)]
        pub input: Option<PathBuf>,
        /// The name of the trace file to write
        #[clap(short, long, default_value = "./perf.data")]
        pub output: PathBuf,
        /// Wakeup watermark in kilobytes (realtime mode)
        #[clap(short, long, default_value_t = 2)]
        pub wakeup: u64,
        #[clap(short, long)]
        pub verbose: bool,
        /// Tracepoint specs, e.g. ":sched:sched_switch" or "MyEvent u32 count"
        pub spec: Vec<String>,
    }
}

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn handle_termination_signal(_signal: libc::c_int) {
    // Only async-signal-safe work: an atomic load plus CancelToken::cancel
    // (atomic store + one write on a pipe).
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
}

fn install_signal_handlers() -> eyre::Result<()> {
    // SAFETY: the action struct is fully initialized before sigaction reads
    // it, and the handler does only async-signal-safe work.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = handle_termination_signal;
        action.sa_sigaction = handler as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error())
                    .wrap_err("Failed to install signal handler");
            }
        }
    }
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = cli::Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    if let Err(err) = collect(&cli) {
        log::error!("{err:#}");
        std::process::exit(exit_code_for(&err));
    }
    Ok(())
}

/// Mirror the OS error code when the failure bottoms out in one; generic
/// failure otherwise.
fn exit_code_for(err: &eyre::Report) -> i32 {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .find_map(std::io::Error::raw_os_error)
        .unwrap_or(1)
}

fn collect(cli: &cli::Cli) -> eyre::Result<()> {
    if cli.wakeup >= cli.buffersize {
        bail!(
            "wakeup watermark ({} KB) must be smaller than the buffer size ({} KB)",
            cli.wakeup,
            cli.buffersize
        );
    }

    let specs = gather_spec_lines(cli)?;
    if specs.is_empty() {
        bail!("No tracepoint specs given (positional args or --input)");
    }

    let token = match CancelToken::new() {
        Ok(token) => CANCEL.get_or_init(|| token),
        Err(err) => return Err(err).wrap_err("Failed to create cancellation pipe"),
    };
    install_signal_handlers()?;

    let mode = match (cli.circular, cli.realtime) {
        (true, false) => Mode::Circular,
        _ => Mode::RealTime,
    };
    // SAFETY: sysconf with a valid name has no preconditions.
    let cpu_count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if cpu_count < 1 {
        bail!("Failed to determine the number of online CPUs");
    }
    let mut session = TracepointSession::new(
        mode,
        cpu_count as usize,
        (cli.buffersize * 1024) as usize,
        (cli.wakeup * 1024) as u32,
    )?;

    // Resolve and enable each spec. Failures are per-tracepoint warnings;
    // collection proceeds as long as at least one tracepoint is live.
    let mut cache = TracepointCache::new("/sys/kernel/tracing");
    for line in &specs {
        let parsed = TracepointSpec::parse(line);
        if let TracepointSpec::Error(err) = &parsed {
            log::warn!("Ignoring spec {line:?}: {err}");
            continue;
        }
        if !parsed.is_usable() {
            continue;
        }
        let registration = match cache.resolve(&parsed) {
            Ok((_, registration)) => registration,
            Err(err) => {
                log::warn!("Failed to resolve {line:?}: {err}");
                continue;
            }
        };
        if let Err(err) = session.enable_tracepoint(registration) {
            log::warn!("Failed to enable {}: {err}", registration.full_name());
        }
    }
    if session.enabled_count() == 0 {
        bail!("None of the given tracepoints could be enabled");
    }

    let mut writer = TraceFileWriter::create(&cli.output)
        .wrap_err_with(|| format!("Failed to create {}", cli.output.display()))?;

    match session.run(&mut writer, token) {
        Ok(()) => {
            log::info!("Wrote {}", cli.output.display());
            Ok(())
        }
        Err(err) => {
            // Keep what can still be read; delete the file only if even the
            // finalize fails (it would not self-describe).
            if writer.finalize_and_close().is_err() {
                remove_partial_file(&cli.output);
            }
            Err(eyre!(err)).wrap_err("Collection failed")
        }
    }
}

/// Positional specs first, then the lines of `--input` (skipping comments
/// and blanks).
fn gather_spec_lines(cli: &cli::Cli) -> eyre::Result<Vec<String>> {
    let mut lines = cli.spec.clone();
    if let Some(input) = &cli.input {
        let text = std::fs::read_to_string(input)
            .wrap_err_with(|| format!("Failed to read {}", input.display()))?;
        lines.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from),
        );
    }
    Ok(lines)
}

fn remove_partial_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        log::warn!("Failed to remove partial file {}: {err}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses() {
        cli::Cli::command().debug_assert();
    }

    #[test]
    fn circular_and_realtime_conflict() {
        let result = cli::Cli::try_parse_from(["tracepoint-collect", "-c", "-C", ":a:b"]);
        assert!(result.is_err());
    }

    #[test]
    fn defaults_match_documentation() {
        let cli = cli::Cli::try_parse_from(["tracepoint-collect", ":sched:sched_switch"]).unwrap();
        assert_eq!(cli.buffersize, 128);
        assert_eq!(cli.wakeup, 2);
        assert_eq!(cli.output, PathBuf::from("./perf.data"));
        assert!(!cli.circular);
    }

    #[test]
    fn buffersize_is_bounded() {
        assert!(cli::Cli::try_parse_from(["t", "-b", "0", ":a:b"]).is_err());
        assert!(cli::Cli::try_parse_from(["t", "-b", "2097153", ":a:b"]).is_err());
        assert!(cli::Cli::try_parse_from(["t", "-b", "2097152", ":a:b"]).is_ok());
    }
}
