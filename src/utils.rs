use std::fmt::Display;
use std::time::Duration;

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

/// Formats an elapsed duration the way every log line in the crate does.
pub(crate) fn as_overhead(elapsed: Duration) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", elapsed.as_millis()))
}

/// Progress style of the root span covering a whole run.
pub(crate) fn get_style_run() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
        .progress_chars("=>-"))
}

/// Progress style of a single running task.
pub(crate) fn get_style_task() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_spinner().template("  {spinner:.blue} {msg} [{elapsed}]")?)
}

/// Installs the `tracing` subscriber used by the command line tool.
///
/// Log lines are routed through the indicatif writer so they never tear the
/// progress bars. The filter defaults to `info` and honours `RUST_LOG`.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let indicatif = IndicatifLayer::new();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
