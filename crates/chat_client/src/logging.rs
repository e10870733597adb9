use std::io;
use tracing_subscriber::EnvFilter;

/// Map verbosity count to filters unless RUST_LOG is set
fn log_filter(verbose_level: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let filter_str = match verbose_level {
        0 => "warn,chat_client=info,reply_stream=info",
        1 => "info,chat_client=debug,reply_stream=debug",
        _ => "debug,chat_client=trace,reply_stream=trace",
    };
    EnvFilter::new(filter_str)
}

pub fn setup_logging(verbose_level: u8) {
    // Stdout carries the reply text, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(verbose_level > 0)
        .with_line_number(verbose_level > 0)
        .with_level(true)
        .with_writer(|| Box::new(io::stderr()) as Box<dyn io::Write + Send>)
        .init();
}
