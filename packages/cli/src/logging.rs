// ABOUTME: tracing-subscriber setup shared by every subcommand
// ABOUTME: RUST_LOG wins when set; otherwise every hatchery* target logs at info, or debug with --verbose

use tracing_subscriber::EnvFilter;

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// Keeps stdout free for machine-readable output
    Stderr,
}

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "hatchery=debug,tower_http=debug"
    } else {
        "hatchery=info"
    }
}

pub fn init(verbose: bool, target: LogTarget) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // A second init (e.g. in tests) is harmless
    let _ = match target {
        LogTarget::Stdout => builder.try_init(),
        LogTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
    };
}
