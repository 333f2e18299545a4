//! Library logging helpers.
//!
//! Log lines follow the syslog-like shape `<unix-time> <pid>/RMR
//! [SITUATION] <message>`, written through whatever `tracing` subscriber
//! the application installed. For applications that have none, the
//! installers here set one up honouring the `RMR_LOG_VLEVEL` digit; when
//! `RMR_HR_LOG=0` each line is encapsulated in a JSON object instead of
//! the plain form.

use anyhow::{Context as _, Result};
use colored::Colorize;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Situation tag written into each line. `tracing` has no critical level,
/// so ERROR carries both of the original ERR/CRIT situations; TRACE is
/// chatter below DEBUG and reported as such.
fn situation(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        _ => "DEBUG", // DEBUG and TRACE both report as debug chatter
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    ts: u64,
    id: u32,
    situation: &'a str,
    msg: &'a str,
}

/// Event formatter producing the library's line shape.
///
/// Human-readable mode colours the situation tag by severity for console
/// use; JSON mode (`RMR_HR_LOG=0`) emits one object per line and never
/// colours.
pub struct SituationFormatter {
    pid: u32,
    hr: bool,
    color: bool,
}

impl SituationFormatter {
    pub fn new(hr: bool, color: bool) -> Self {
        Self { pid: std::process::id(), hr, color }
    }
}

impl<S, N> FormatEvent<S, N> for SituationFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // fields are buffered so a whole line can be encapsulated as JSON
        let mut body = String::new();
        let mut buf_writer = Writer::new(&mut body);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let level = *event.metadata().level();
        let sit = situation(level);
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

        if !self.hr {
            let line = JsonLine { ts, id: self.pid, situation: sit, msg: &body };
            return match serde_json::to_string(&line) {
                Ok(json) => writeln!(writer, "{}", json),
                Err(_) => writeln!(writer, "{} {}/RMR [{}] {}", ts, self.pid, sit, body),
            };
        }

        if self.color {
            let tag = match level {
                Level::ERROR => format!("[{sit}]").red(),
                Level::WARN => format!("[{sit}]").yellow(),
                Level::INFO => format!("[{sit}]").white(),
                _ => format!("[{sit}]").blue(),
            };
            writeln!(writer, "{} {}/RMR {} {}", ts, self.pid, tag, body)
        } else {
            writeln!(writer, "{} {}/RMR [{}] {}", ts, self.pid, sit, body)
        }
    }
}

/// Map a 0-5 verbosity digit (RMR_LOG_VLEVEL) onto a tracing filter.
pub fn filter_for_vlevel(vlevel: u8) -> EnvFilter {
    let directive = match vlevel {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 | 4 => "debug",
        _ => "trace",
    };
    EnvFilter::new(directive)
}

/// Install a console subscriber honouring the verbosity digit. Intended
/// for applications that have no subscriber of their own; errors when one
/// is already installed (harmless — the existing one wins). `hr_log`
/// false selects the JSON line shape.
pub fn init_console(vlevel: u8, hr_log: bool) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .event_format(SituationFormatter::new(hr_log, true))
        .with_env_filter(filter_for_vlevel(vlevel))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("a global tracing subscriber is already installed")
}

/// Install a daily-rolling file subscriber instead of console output. The
/// returned guard must be held for the life of the process or buffered
/// lines are lost.
pub fn init_file(
    vlevel: u8,
    hr_log: bool,
    dir: &Path,
    file_name: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let subscriber = tracing_subscriber::fmt()
        .event_format(SituationFormatter::new(hr_log, false))
        .with_env_filter(filter_for_vlevel(vlevel))
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("a global tracing subscriber is already installed")?;
    Ok(guard)
}

/// Read the verbosity digit from the control file; 0 when the file is
/// missing or unparsable. The collector polls this so the level can be
/// changed after start, which helps debugging.
pub fn read_vlevel(path: &Path) -> i32 {
    match std::fs::read_to_string(path) {
        Ok(text) => text.trim().parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}
