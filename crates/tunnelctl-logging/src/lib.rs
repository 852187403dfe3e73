use colored::*;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Event formatter producing `2024-05-01 12:00:03  INFO tunnelctl_ssh::controller: ...`.
struct TunnelFormatter {
    use_color: bool,
}

fn level_label(level: Level, use_color: bool) -> ColoredString {
    let label = match level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => " INFO",
        Level::WARN => " WARN",
        Level::ERROR => "ERROR",
    };
    if !use_color {
        return label.normal();
    }
    match level {
        Level::TRACE => label.magenta().bold(),
        Level::DEBUG => label.blue().bold(),
        Level::INFO => label.green().bold(),
        Level::WARN => label.yellow().bold(),
        Level::ERROR => label.red().bold(),
    }
}

impl<S, N> FormatEvent<S, N> for TunnelFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let level = level_label(*metadata.level(), self.use_color);
        let target = if self.use_color {
            metadata.target().dimmed()
        } else {
            metadata.target().normal()
        };

        write!(writer, "{} {} {}: ", time, level, target)?;

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Parses a level name, falling back to INFO for anything unrecognised.
pub fn parse_level(level_str: &str) -> Level {
    Level::from_str(level_str.trim()).unwrap_or(Level::INFO)
}

/// Initializes the global logger on stderr. `RUST_LOG` overrides `level_str`.
pub fn init_logging(
    level_str: &str,
    use_color: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level(level_str).into())
        .from_env_lossy();

    let layer = Layer::default()
        .with_writer(std::io::stderr)
        .event_format(TunnelFormatter { use_color });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()?;

    Ok(())
}
