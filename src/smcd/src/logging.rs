use std::fmt;
use std::path::Path;

use ansi_term::Colour;
use anyhow::{anyhow, Context, Result};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{Directive, EnvFilter};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

use crate::config::{Config, TracingConfig};

const LOG_ENV: &str = "SMC_LOG";
const MIN_EVENT_FILTER_ENV: &str = "SMC_MIN_TRACING_EVENT";
const MAX_EVENT_FILTER_ENV: &str = "SMC_MAX_TRACING_EVENT";
const SPAN_FILTER_ENV: &str = "SMC_TRACING_SPAN";

pub type LogGuards = (
    tracing_appender::non_blocking::WorkerGuard,
    tracing_chrome::FlushGuard,
);

fn level_str(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => " INFO",
        Level::WARN => " WARN",
        Level::ERROR => "ERROR",
    }
}

fn level_colour(level: &Level) -> Colour {
    match *level {
        Level::TRACE => Colour::Purple,
        Level::DEBUG => Colour::Blue,
        Level::INFO => Colour::Green,
        Level::WARN => Colour::Yellow,
        Level::ERROR => Colour::Red,
    }
}

/// `[time LEVEL file:line] fields`
struct SmcFormatter {
    ansi: bool,
}

impl<S, N> FormatEvent<S, N> for SmcFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let level = metadata.level();
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f");
        let location = (
            metadata.file().unwrap_or("<unnamed>"),
            metadata.line().unwrap_or(0),
        );
        if self.ansi && writer.has_ansi_escapes() {
            let paint = level_colour(level).paint(level_str(level));
            write!(writer, "[{} {} {}:{}] ", now, paint, location.0, location.1)?;
        } else {
            write!(writer, "[{} {} {}:{}] ", now, level_str(level), location.0, location.1)?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn env_filter(default: &str, env: &str) -> Result<EnvFilter> {
    let directive: Directive = default
        .parse()
        .with_context(|| format!("invalid default level {:?} for {}", default, env))?;
    Ok(EnvFilter::builder()
        .with_default_directive(directive)
        .with_env_var(env)
        .from_env_lossy())
}

fn filter_level(filter: &EnvFilter) -> Result<Level> {
    use tracing_subscriber::prelude::*;

    filter
        .max_level_hint()
        .and_then(LevelFilter::into_level)
        .ok_or_else(|| anyhow!("{} does not select any level", filter))
}

/// Print events selected by `SMC_LOG` (default `config.log_level`) to stdout.
///
/// With tracing enabled, events between the min and max tracing level also go to a rolling
/// `event.log` and spans to `tracing.json` in the output directory. The returned guards must be
/// kept alive until exit.
pub fn init_log(config: &Config, ansi: bool) -> Result<Option<LogGuards>> {
    use tracing_subscriber::prelude::*;

    let log_fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(SmcFormatter { ansi })
        .with_filter(env_filter(&config.log_level, LOG_ENV)?);
    let registry = tracing_subscriber::registry().with(log_fmt_layer);

    if !config.tracing.enable {
        registry.init();
        return Ok(None);
    }
    let guards = init_tracing(&config.tracing, registry)?;
    tracing::info!("tracing to {}", config.tracing.output_dir);
    Ok(Some(guards))
}

fn init_tracing<L>(config: &TracingConfig, registry: L) -> Result<LogGuards>
where
    L: Subscriber + for<'span> LookupSpan<'span> + Send + Sync,
{
    use tracing_subscriber::prelude::*;

    let min_event_level = filter_level(&env_filter(&config.min_event_level, MIN_EVENT_FILTER_ENV)?)?;
    let max_event_level = filter_level(&env_filter(&config.max_event_level, MAX_EVENT_FILTER_ENV)?)?;

    let file_appender = tracing_appender::rolling::minutely(&config.output_dir, "event.log");
    let (non_blocking, appender_guard) = tracing_appender::non_blocking(file_appender);
    let tracing_fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(SmcFormatter { ansi: false })
        .with_writer(
            non_blocking
                .with_min_level(min_event_level)
                .with_max_level(max_event_level),
        )
        .with_filter(EnvFilter::new("trace"));

    let (chrome_layer, flush_guard) = tracing_chrome::ChromeLayerBuilder::new()
        .file(Path::new(&config.output_dir).join("tracing.json"))
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();

    registry
        .with(tracing_fmt_layer)
        .with(chrome_layer.with_filter(env_filter(&config.span_level, SPAN_FILTER_ENV)?))
        .init();

    Ok((appender_guard, flush_guard))
}
