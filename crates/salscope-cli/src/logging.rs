use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const QUIET: &str = "warn,salscope_storage=info,salscope_sync=info,salscope_stats=info";
const VERBOSE: &str = "info,salscope_storage=debug,salscope_sync=debug,salscope_stats=debug";

/// `SALSCOPE_LOG` wins over `RUST_LOG`; both win over `--verbose`.
fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env("SALSCOPE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(if verbose { VERBOSE } else { QUIET }))
}

/// Logs go to stderr so command output on stdout stays valid JSON.
pub fn init_cli_logger(verbose: bool, json: bool) {
    let registry = tracing_subscriber::registry().with(env_filter(verbose));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer.compact()).init();
    }
}
