//! Wire logger: turns engine log callbacks into `LogEvent` frames.

use std::collections::HashMap;

use super::HostChannel;
use crate::engine::{render_diagnostic, Logger};
use crate::proto;
use crate::proto::{outbound_message, LogEventType, SourceSpan};

/// Without `verbose`, identical warnings stop being forwarded after this
/// many occurrences.
const MAX_REPETITIONS: usize = 5;

pub(crate) struct WireLogger {
    channel: HostChannel,
    color: bool,
    ascii: bool,
    quiet_deps: bool,
    verbose: bool,
    entry_url: Option<String>,
    seen: HashMap<String, usize>,
}

impl WireLogger {
    pub(crate) fn new(
        channel: HostChannel,
        color: bool,
        ascii: bool,
        quiet_deps: bool,
        verbose: bool,
        entry_url: Option<String>,
    ) -> Self {
        Self {
            channel,
            color,
            ascii,
            quiet_deps,
            verbose,
            entry_url,
            seen: HashMap::new(),
        }
    }

    fn from_dependency(&self, span: Option<&SourceSpan>) -> bool {
        let Some(span) = span else { return false };
        if span.url.is_empty() {
            return false;
        }
        self.entry_url.as_deref() != Some(span.url.as_str())
    }

    fn emit(
        &self,
        kind: LogEventType,
        message: &str,
        span: Option<&SourceSpan>,
        formatted: String,
    ) {
        let event = proto::LogEvent {
            compilation_id: self.channel.compilation_id(),
            r#type: kind as i32,
            message: message.to_string(),
            span: span.cloned(),
            stack_trace: trace_line(span),
            formatted,
        };
        self.channel.notify(outbound_message::Message::LogEvent(event));
    }
}

impl Logger for WireLogger {
    fn warn(&mut self, message: &str, span: Option<&SourceSpan>, deprecation: bool) {
        if self.quiet_deps && self.from_dependency(span) {
            return;
        }
        if !self.verbose {
            let count = self.seen.entry(message.to_string()).or_insert(0);
            *count += 1;
            if *count > MAX_REPETITIONS + 1 {
                return;
            }
            if *count == MAX_REPETITIONS + 1 {
                let notice = format!(
                    "Warning repeated {MAX_REPETITIONS} times; further occurrences suppressed."
                );
                let formatted =
                    render_diagnostic("Warning", &notice, None, self.color, self.ascii);
                self.emit(LogEventType::Warning, &notice, None, formatted);
                return;
            }
        }
        let (kind, heading) = if deprecation {
            (LogEventType::DeprecationWarning, "Deprecation Warning")
        } else {
            (LogEventType::Warning, "Warning")
        };
        let formatted = render_diagnostic(heading, message, span, self.color, self.ascii);
        self.emit(kind, message, span, formatted);
    }

    fn debug(&mut self, message: &str, span: Option<&SourceSpan>) {
        let origin = span
            .filter(|s| !s.url.is_empty())
            .map(|s| s.url.clone())
            .unwrap_or_else(|| "-".to_string());
        let line = span
            .and_then(|s| s.start.as_ref())
            .map(|start| start.line + 1)
            .unwrap_or(1);
        let formatted = format!("{origin}:{line} DEBUG: {message}\n");
        self.emit(LogEventType::Debug, message, span, formatted);
    }
}

fn trace_line(span: Option<&SourceSpan>) -> String {
    let Some(span) = span else {
        return String::new();
    };
    let start = span.start.clone().unwrap_or_default();
    let origin = if span.url.is_empty() {
        "-"
    } else {
        span.url.as_str()
    };
    format!("{origin} {}:{}  root stylesheet\n", start.line + 1, start.column + 1)
}
