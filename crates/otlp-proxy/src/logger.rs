//! Custom tracing formatter and subscriber setup.
//!
//! Log lines are prefixed with `OTLP_PROXY` so proxy output is easy to filter
//! out of mixed container logs:
//!
//! ```text
//! OTLP_PROXY | INFO | listening on 0.0.0.0:8080
//! OTLP_PROXY | WARN | forwarder queue full: rejecting request to /v1/logs
//! ```
//!
//! The level filter honors `RUST_LOG` when set; otherwise the `log_level`
//! configuration option is applied once the config file has been parsed.

use std::fmt;

use tracing::error;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

const DEFAULT_DIRECTIVES: &str = "info";

/// Log formatter that prefixes every line with `OTLP_PROXY | LEVEL |` and
/// includes the active span hierarchy.
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
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
        write!(&mut writer, "OTLP_PROXY | {} | ", metadata.level())?;

        // Spans from root to current, fields in braces when present
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Handle for adjusting the level filter after initialization.
///
/// The subscriber has to exist before the config file is parsed (so parse
/// warnings are visible), but the configured level is only known afterwards.
pub struct LevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LevelHandle {
    /// Applies the configured log level. `RUST_LOG` takes priority when set.
    pub fn set_level(&self, level: &str) {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let directives = EnvFilter::new(level);
        if let Err(e) = self.handle.modify(|filter| *filter = directives) {
            error!("failed to update log level: {e}");
        }
    }
}

/// Installs the global subscriber. Safe to call more than once; only the
/// first call wins.
pub fn init() -> LevelHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let (filter, handle) = reload::Layer::new(filter);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().event_format(Formatter))
        .try_init();

    LevelHandle { handle }
}
