use tracing_subscriber::EnvFilter;

/// Installs a stderr subscriber whose level follows `-v` repetitions.
///
/// `RUST_LOG` overrides the verbosity when set. Installing twice is a no-op,
/// so embedding `run` in tests is safe.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info,inplace=info",
        2 => "info,inplace=debug",
        _ => "debug,inplace=trace",
    }
}
