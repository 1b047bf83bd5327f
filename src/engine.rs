//! Contract between the host and the stylesheet compilation engine.
//!
//! The engine is a blocking function: it runs on the worker's dedicated
//! thread and may suspend arbitrarily long inside any of the callback
//! traits below. The host hands it a fully-assembled [`CompilationRequest`]
//! and receives either a [`CompileOutput`] or a [`CompileFailure`]; a panic
//! escaping [`Engine::compile`] is caught at the worker boundary and
//! treated as an internal error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::proto::source_span::SourceLocation;
use crate::proto::{OutputStyle, SourceSpan, Syntax};

pub mod builtin;

/// A stylesheet source loaded through an importer.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub contents: String,
    pub syntax: Syntax,
    pub source_map_url: Option<String>,
}

/// Resolves and loads stylesheets referenced by `@import`.
///
/// `Ok(None)` means the importer doesn't recognize the URL and the next
/// importer in the chain should be consulted. `Err` carries the importer's
/// own failure text and aborts the compilation with a `CompileFailure`.
pub trait Importer {
    fn canonicalize(&mut self, url: &str, from_import: bool) -> Result<Option<String>, String>;
    fn load(&mut self, canonical_url: &str) -> Result<Option<Loaded>, String>;
}

/// Custom functions the engine delegates by name.
pub trait Functions {
    /// Whether `name` was declared by the compile request.
    fn knows(&self, name: &str) -> bool;
    fn call(&mut self, name: &str, arguments: &[Value]) -> Result<Value, String>;
}

/// Per-compilation log sink.
pub trait Logger {
    fn warn(&mut self, message: &str, span: Option<&SourceSpan>, deprecation: bool);
    fn debug(&mut self, message: &str, span: Option<&SourceSpan>);
}

/// An engine-level value, exchanged with host functions.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number { value: f64, unit: String },
    Str { text: String, quoted: bool },
    Bool(bool),
}

#[derive(Debug)]
pub enum Input {
    String {
        source: String,
        url: Option<String>,
        syntax: Syntax,
    },
    Path(PathBuf),
}

/// Everything the engine needs for one compilation.
pub struct CompilationRequest {
    pub input: Input,
    pub importers: Vec<Box<dyn Importer>>,
    pub functions: Box<dyn Functions>,
    pub logger: Box<dyn Logger>,
    pub style: OutputStyle,
    pub source_map: bool,
    pub source_map_include_sources: bool,
    pub charset: bool,
    pub alert_color: bool,
    pub alert_ascii: bool,
}

impl std::fmt::Debug for CompilationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationRequest")
            .field("input", &self.input)
            .field("importers", &self.importers.len())
            .field("style", &self.style)
            .field("source_map", &self.source_map)
            .field(
                "source_map_include_sources",
                &self.source_map_include_sources,
            )
            .field("charset", &self.charset)
            .field("alert_color", &self.alert_color)
            .field("alert_ascii", &self.alert_ascii)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub css: String,
    pub source_map: Option<String>,
    /// Canonical URLs of every loaded source, in first-load order.
    pub loaded_urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CompileFailure {
    pub message: String,
    pub span: Option<SourceSpan>,
    pub stack_trace: String,
    pub formatted: String,
}

pub trait Engine: Send + Sync {
    fn compile(&self, request: CompilationRequest) -> Result<CompileOutput, Box<CompileFailure>>;
}

/// Converts a filesystem path to a `file:` URL.
pub fn file_url(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    format!("file://{}", absolute.display())
}

/// Extracts the path from a `file:` URL, if it is one.
pub fn from_file_url(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://").map(PathBuf::from)
}

/// Loads stylesheets from disk relative to a base directory, without host
/// involvement.
#[derive(Debug)]
pub struct FilesystemImporter {
    base: PathBuf,
}

impl FilesystemImporter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn candidates(url: &str) -> Vec<String> {
        let mut out = vec![url.to_string()];
        if Path::new(url).extension().is_none() {
            out.push(format!("{url}.scss"));
            out.push(format!("{url}.css"));
            // Partial naming convention.
            if let Some(name) = url.rsplit('/').next() {
                let prefix = &url[..url.len() - name.len()];
                out.push(format!("{prefix}_{name}.scss"));
            }
        }
        out
    }
}

impl Importer for FilesystemImporter {
    fn canonicalize(&mut self, url: &str, _from_import: bool) -> Result<Option<String>, String> {
        let relative = from_file_url(url)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| url.to_string());
        for candidate in Self::candidates(&relative) {
            let path = self.base.join(&candidate);
            if path.is_file() {
                let resolved = fs::canonicalize(&path).unwrap_or(path);
                return Ok(Some(file_url(&resolved)));
            }
        }
        Ok(None)
    }

    fn load(&mut self, canonical_url: &str) -> Result<Option<Loaded>, String> {
        load_from_disk(canonical_url)
    }
}

/// Reads the stylesheet a `file:` URL points at. `Ok(None)` if the URL has
/// another scheme or the file doesn't exist.
pub fn load_from_disk(canonical_url: &str) -> Result<Option<Loaded>, String> {
    let Some(path) = from_file_url(canonical_url) else {
        return Ok(None);
    };
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(Some(Loaded {
            contents,
            syntax: syntax_for_path(&path),
            source_map_url: None,
        })),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(format!("Failed to read {}: {err}", path.display())),
    }
}

pub fn syntax_for_path(path: &Path) -> Syntax {
    match path.extension().and_then(|e| e.to_str()) {
        Some("css") => Syntax::Css,
        Some("sass") => Syntax::Indented,
        _ => Syntax::Scss,
    }
}

/// A span covering a single location, used when no source text is
/// available (e.g. a missing entry file).
pub fn zero_span(url: String) -> SourceSpan {
    let location = SourceLocation {
        offset: 0,
        line: 0,
        column: 0,
    };
    SourceSpan {
        text: String::new(),
        start: Some(location.clone()),
        end: Some(location),
        url,
        context: String::new(),
    }
}

const RED: &str = "\u{1b}[31m";
const YELLOW: &str = "\u{1b}[33m";
const BOLD: &str = "\u{1b}[1m";
const RESET: &str = "\u{1b}[0m";

/// Renders a diagnostic the way it appears in `CompileFailure.formatted`
/// and `LogEvent.formatted`: a heading, the offending line with an
/// underline, and a trace tail.
pub fn render_diagnostic(
    heading: &str,
    message: &str,
    span: Option<&SourceSpan>,
    color: bool,
    ascii: bool,
) -> String {
    let (bold, tone, reset) = if color {
        let tone = if heading.starts_with("Error") { RED } else { YELLOW };
        (BOLD, tone, RESET)
    } else {
        ("", "", "")
    };

    let mut out = format!("{bold}{tone}{heading}{reset}{bold}: {message}{reset}\n");
    let Some(span) = span else {
        return out;
    };

    let (top, bar, bottom) = if ascii {
        (",", "|", "'")
    } else {
        ("\u{2577}", "\u{2502}", "\u{2575}")
    };

    let start = span.start.clone().unwrap_or_default();
    let line_number = start.line + 1;
    let gutter = line_number.to_string().len();
    let underline_len = span
        .end
        .as_ref()
        .map(|end| {
            if end.line == start.line && end.column > start.column {
                (end.column - start.column) as usize
            } else {
                span.text.lines().next().map(str::len).unwrap_or(1).max(1)
            }
        })
        .unwrap_or(1)
        .max(1);

    out.push_str(&format!("{:gutter$} {top}\n", ""));
    out.push_str(&format!("{line_number} {bar} {}\n", span.context.trim_end()));
    out.push_str(&format!(
        "{:gutter$} {bar} {:pad$}{tone}{}{reset}\n",
        "",
        "",
        "^".repeat(underline_len),
        pad = start.column as usize
    ));
    out.push_str(&format!("{:gutter$} {bottom}\n", ""));

    let origin = if span.url.is_empty() { "-" } else { span.url.as_str() };
    out.push_str(&format!(
        "  {origin} {line_number}:{}  root stylesheet\n",
        start.column + 1
    ));
    out
}
