//! Reference stylesheet engine.
//!
//! A small SCSS-subset evaluator that exists so every host callback path —
//! importer canonicalization and loading, custom function dispatch, log
//! events — is exercised by real compilations. It handles flat rules,
//! variables, unit arithmetic, `@import`, `@debug`, and `@warn`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde_json::json;

use super::{
    file_url, from_file_url, render_diagnostic, syntax_for_path, zero_span, CompilationRequest,
    CompileFailure, CompileOutput, Engine, FilesystemImporter, Importer, Input, Loaded, Value,
};
use crate::proto::source_span::SourceLocation;
use crate::proto::{OutputStyle, SourceSpan, Syntax};

pub struct BuiltinEngine;

impl Engine for BuiltinEngine {
    fn compile(&self, request: CompilationRequest) -> Result<CompileOutput, Box<CompileFailure>> {
        let color = request.alert_color;
        let ascii = request.alert_ascii;
        let (evaluator, input) = Evaluator::new(request);
        evaluator.run(input).map_err(|err| {
            let start = err
                .span
                .start
                .clone()
                .unwrap_or_default();
            let origin = if err.span.url.is_empty() {
                "-"
            } else {
                err.span.url.as_str()
            };
            let stack_trace = format!("{origin} {}:{}  root stylesheet\n", start.line + 1, start.column + 1);
            let formatted =
                render_diagnostic("Error", &err.message, Some(&err.span), color, ascii);
            Box::new(CompileFailure {
                message: err.message,
                span: Some(err.span),
                stack_trace,
                formatted,
            })
        })
    }
}

#[derive(Debug)]
struct EvalError {
    message: String,
    span: SourceSpan,
}

struct Rule {
    selector: String,
    declarations: Vec<(String, String)>,
}

struct Evaluator {
    importers: Vec<Box<dyn Importer>>,
    functions: Box<dyn super::Functions>,
    logger: Box<dyn super::Logger>,
    style: OutputStyle,
    charset: bool,
    source_map: bool,
    include_sources: bool,
    variables: HashMap<String, Value>,
    rules: Vec<Rule>,
    loaded_urls: Vec<String>,
    /// (canonical url, contents) of every recorded source, for source maps.
    sources: Vec<(String, String)>,
    /// URLs currently being evaluated, entry file at the bottom.
    import_stack: Vec<String>,
}

impl Evaluator {
    fn new(request: CompilationRequest) -> (Self, Input) {
        let CompilationRequest {
            input,
            importers,
            functions,
            logger,
            style,
            source_map,
            source_map_include_sources,
            charset,
            ..
        } = request;
        (
            Evaluator {
                importers,
                functions,
                logger,
                style,
                charset,
                source_map,
                include_sources: source_map_include_sources,
                variables: HashMap::new(),
                rules: Vec::new(),
                loaded_urls: Vec::new(),
                sources: Vec::new(),
                import_stack: Vec::new(),
            },
            input,
        )
    }

    fn run(mut self, input: Input) -> Result<CompileOutput, EvalError> {
        let (source, url, syntax) = match input {
            Input::String { source, url, syntax } => (source, url, syntax),
            Input::Path(path) => match fs::read_to_string(&path) {
                Ok(source) => {
                    let url = file_url(&path);
                    (source, Some(url), syntax_for_path(&path))
                }
                Err(err) => {
                    return Err(EvalError {
                        message: format!("Error reading {}: {err}.", path.display()),
                        span: zero_span(file_url(&path)),
                    });
                }
            },
        };

        if syntax == Syntax::Indented {
            return Err(EvalError {
                message: "The indented syntax is not supported.".into(),
                span: zero_span(url.clone().unwrap_or_default()),
            });
        }

        if let Some(url) = &url {
            self.record_load(url, &source);
            self.import_stack.push(url.clone());
        }

        let mut cursor = Cursor::new(&source, url);
        self.eval_document(&mut cursor)?;

        let css = self.apply_charset(self.serialize());
        let source_map = self.source_map.then(|| self.build_source_map());
        Ok(CompileOutput {
            css,
            source_map,
            loaded_urls: self.loaded_urls.clone(),
        })
    }

    fn eval_document(&mut self, cur: &mut Cursor) -> Result<(), EvalError> {
        loop {
            cur.skip_trivia();
            match cur.peek() {
                None => return Ok(()),
                Some('@') => self.eval_at_rule(cur, false)?,
                Some('$') => self.eval_variable(cur)?,
                Some('}') => return Err(cur.error_here("unmatched \"}\".")),
                Some(_) => self.eval_rule(cur)?,
            }
        }
    }

    fn eval_variable(&mut self, cur: &mut Cursor) -> Result<(), EvalError> {
        cur.bump();
        let name = cur
            .ident()
            .ok_or_else(|| cur.error_here("expected variable name."))?;
        cur.skip_trivia();
        cur.expect(':')?;
        let value = self.eval_expr(cur)?;
        cur.skip_trivia();
        if cur.peek() == Some(';') {
            cur.bump();
        }
        self.variables.insert(name, value);
        Ok(())
    }

    fn eval_rule(&mut self, cur: &mut Cursor) -> Result<(), EvalError> {
        let start = cur.location();
        let mut raw = String::new();
        loop {
            match cur.peek() {
                Some('{') => {
                    cur.bump();
                    break;
                }
                Some(';') | Some('}') | None => {
                    return Err(cur.error_at(&start, "expected \"{\"."));
                }
                Some(c) => {
                    raw.push(c);
                    cur.bump();
                }
            }
        }
        let selector = raw.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut declarations = Vec::new();
        loop {
            cur.skip_trivia();
            match cur.peek() {
                None => return Err(cur.error_at(&start, "expected \"}\".")),
                Some('}') => {
                    cur.bump();
                    break;
                }
                Some('$') => self.eval_variable(cur)?,
                Some('@') => self.eval_at_rule(cur, true)?,
                Some(_) => {
                    let name = cur
                        .ident()
                        .ok_or_else(|| cur.error_here("expected declaration."))?;
                    cur.skip_trivia();
                    cur.expect(':')?;
                    let value = self.eval_expr(cur)?;
                    cur.skip_trivia();
                    match cur.peek() {
                        Some(';') => {
                            cur.bump();
                        }
                        Some('}') | None => {}
                        Some(_) => return Err(cur.error_here("expected \";\".")),
                    }
                    declarations.push((name, render_value(&value)));
                }
            }
        }

        if !declarations.is_empty() {
            self.rules.push(Rule {
                selector,
                declarations,
            });
        }
        Ok(())
    }

    fn eval_at_rule(&mut self, cur: &mut Cursor, in_rule: bool) -> Result<(), EvalError> {
        let start = cur.location();
        cur.bump();
        let name = cur
            .ident()
            .ok_or_else(|| cur.error_here("expected at-rule name."))?;
        cur.skip_trivia();
        match name.as_str() {
            "import" if in_rule => Err(cur.error_at(&start, "@import is not allowed within rules.")),
            "import" => {
                let url = self.parse_quoted(cur)?;
                cur.skip_trivia();
                if cur.peek() == Some(';') {
                    cur.bump();
                }
                let span = cur.span_from(&start);
                self.import(&url, span)
            }
            "debug" => {
                let value = self.eval_expr(cur)?;
                if cur.peek() == Some(';') {
                    cur.bump();
                }
                let span = cur.span_from(&start);
                self.logger.debug(&render_value(&value), Some(&span));
                Ok(())
            }
            "warn" => {
                let value = self.eval_expr(cur)?;
                if cur.peek() == Some(';') {
                    cur.bump();
                }
                let span = cur.span_from(&start);
                self.logger.warn(&render_value(&value), Some(&span), false);
                Ok(())
            }
            "charset" => {
                let _ = self.parse_quoted(cur)?;
                cur.skip_trivia();
                if cur.peek() == Some(';') {
                    cur.bump();
                }
                Ok(())
            }
            other => Err(cur.error_at(&start, &format!("Unknown at-rule: @{other}."))),
        }
    }

    fn import(&mut self, url: &str, span: SourceSpan) -> Result<(), EvalError> {
        let mut resolved: Option<(String, Loaded)> = None;

        for index in 0..self.importers.len() {
            let canonical = self.importers[index]
                .canonicalize(url, true)
                .map_err(|message| EvalError {
                    message,
                    span: span.clone(),
                })?;
            let Some(canonical) = canonical else {
                continue;
            };
            let loaded = self.importers[index]
                .load(&canonical)
                .map_err(|message| EvalError {
                    message,
                    span: span.clone(),
                })?
                .ok_or_else(|| EvalError {
                    message: format!("Importer canonicalized {url} to {canonical} but couldn't load it."),
                    span: span.clone(),
                })?;
            resolved = Some((canonical, loaded));
            break;
        }

        // Unclaimed imports from file-backed stylesheets fall back to the
        // directory of the importing file.
        if resolved.is_none() {
            if let Some(dir) = self.current_directory() {
                let mut fallback = FilesystemImporter::new(dir);
                if let Some(canonical) = fallback.canonicalize(url, true).map_err(|message| {
                    EvalError {
                        message,
                        span: span.clone(),
                    }
                })? {
                    let loaded = fallback
                        .load(&canonical)
                        .map_err(|message| EvalError {
                            message,
                            span: span.clone(),
                        })?
                        .ok_or_else(|| EvalError {
                            message: format!("Failed to load {canonical}."),
                            span: span.clone(),
                        })?;
                    resolved = Some((canonical, loaded));
                }
            }
        }

        let Some((canonical, loaded)) = resolved else {
            return Err(EvalError {
                message: "Can't find stylesheet to import.".into(),
                span,
            });
        };

        if self.import_stack.contains(&canonical) {
            return Err(EvalError {
                message: "This file is already being loaded.".into(),
                span,
            });
        }
        if loaded.syntax == Syntax::Indented {
            return Err(EvalError {
                message: "The indented syntax is not supported.".into(),
                span,
            });
        }

        self.record_load(&canonical, &loaded.contents);
        self.import_stack.push(canonical.clone());
        let mut cursor = Cursor::new(&loaded.contents, Some(canonical));
        let result = self.eval_document(&mut cursor);
        self.import_stack.pop();
        result
    }

    fn current_directory(&self) -> Option<PathBuf> {
        let current = self.import_stack.last()?;
        let path = from_file_url(current)?;
        path.parent().map(PathBuf::from)
    }

    fn record_load(&mut self, url: &str, contents: &str) {
        if !self.loaded_urls.iter().any(|u| u == url) {
            self.loaded_urls.push(url.to_string());
        }
        self.sources.push((url.to_string(), contents.to_string()));
    }

    fn parse_quoted(&mut self, cur: &mut Cursor) -> Result<String, EvalError> {
        let quote = match cur.peek() {
            Some(c @ ('"' | '\'')) => c,
            _ => return Err(cur.error_here("expected string.")),
        };
        cur.bump();
        let mut out = String::new();
        loop {
            match cur.peek() {
                None => return Err(cur.error_here("expected closing quote.")),
                Some(c) if c == quote => {
                    cur.bump();
                    return Ok(out);
                }
                Some('\\') => {
                    cur.bump();
                    if let Some(escaped) = cur.peek() {
                        out.push(escaped);
                        cur.bump();
                    }
                }
                Some(c) => {
                    out.push(c);
                    cur.bump();
                }
            }
        }
    }

    fn eval_expr(&mut self, cur: &mut Cursor) -> Result<Value, EvalError> {
        cur.skip_trivia();
        let start = cur.location();
        let mut left = self.eval_product(cur)?;
        loop {
            cur.skip_trivia();
            let op = match cur.peek() {
                Some('+') => '+',
                // A minus only acts as an operator when spaced; otherwise it
                // belongs to the following token.
                Some('-') if cur.peek_at(1).is_some_and(|c| c.is_whitespace()) => '-',
                _ => return Ok(left),
            };
            cur.bump();
            let right = self.eval_product(cur)?;
            left = apply_op(op, &left, &right).map_err(|message| EvalError {
                message,
                span: cur.span_from(&start),
            })?;
        }
    }

    fn eval_product(&mut self, cur: &mut Cursor) -> Result<Value, EvalError> {
        cur.skip_trivia();
        let start = cur.location();
        let mut left = self.eval_primary(cur)?;
        loop {
            cur.skip_trivia();
            let op = match cur.peek() {
                Some('*') => '*',
                Some('/') => '/',
                _ => return Ok(left),
            };
            cur.bump();
            let right = self.eval_primary(cur)?;
            left = apply_op(op, &left, &right).map_err(|message| EvalError {
                message,
                span: cur.span_from(&start),
            })?;
        }
    }

    fn eval_primary(&mut self, cur: &mut Cursor) -> Result<Value, EvalError> {
        cur.skip_trivia();
        let start = cur.location();
        match cur.peek() {
            Some('(') => {
                cur.bump();
                let value = self.eval_expr(cur)?;
                cur.skip_trivia();
                cur.expect(')')?;
                Ok(value)
            }
            Some('"') | Some('\'') => {
                let text = self.parse_quoted(cur)?;
                Ok(Value::Str { text, quoted: true })
            }
            Some('$') => {
                cur.bump();
                let name = cur
                    .ident()
                    .ok_or_else(|| cur.error_here("expected variable name."))?;
                self.variables.get(&name).cloned().ok_or_else(|| {
                    cur.error_at(&start, &format!("Undefined variable: ${name}."))
                })
            }
            Some('#') => {
                cur.bump();
                let mut hex = String::from("#");
                while let Some(c) = cur.peek() {
                    if c.is_ascii_hexdigit() {
                        hex.push(c);
                        cur.bump();
                    } else {
                        break;
                    }
                }
                Ok(Value::Str {
                    text: hex,
                    quoted: false,
                })
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(cur),
            Some('-') if cur.peek_at(1).is_some_and(|c| c.is_ascii_digit() || c == '.') => {
                self.parse_number(cur)
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {
                let name = cur
                    .ident()
                    .ok_or_else(|| cur.error_here("expected expression."))?;
                if cur.peek() == Some('(') {
                    return self.eval_call(cur, name, start);
                }
                match name.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Ok(Value::Str {
                        text: name,
                        quoted: false,
                    }),
                }
            }
            _ => Err(cur.error_here("expected expression.")),
        }
    }

    fn eval_call(
        &mut self,
        cur: &mut Cursor,
        name: String,
        start: SourceLocation,
    ) -> Result<Value, EvalError> {
        cur.bump();
        let mut arguments = Vec::new();
        cur.skip_trivia();
        if cur.peek() != Some(')') {
            loop {
                arguments.push(self.eval_expr(cur)?);
                cur.skip_trivia();
                match cur.peek() {
                    Some(',') => {
                        cur.bump();
                    }
                    Some(')') => break,
                    _ => return Err(cur.error_here("expected \")\".")),
                }
            }
        }
        cur.bump();

        if self.functions.knows(&name) {
            let span = cur.span_from(&start);
            self.functions
                .call(&name, &arguments)
                .map_err(|message| EvalError { message, span })
        } else {
            // Unknown functions render as plain CSS calls.
            let rendered: Vec<String> = arguments.iter().map(render_value).collect();
            Ok(Value::Str {
                text: format!("{name}({})", rendered.join(", ")),
                quoted: false,
            })
        }
    }

    fn parse_number(&mut self, cur: &mut Cursor) -> Result<Value, EvalError> {
        let start = cur.location();
        let mut digits = String::new();
        if cur.peek() == Some('-') {
            digits.push('-');
            cur.bump();
        }
        while let Some(c) = cur.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                cur.bump();
            } else {
                break;
            }
        }
        if cur.peek() == Some('.') && cur.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            digits.push('.');
            cur.bump();
            while let Some(c) = cur.peek() {
                if c.is_ascii_digit() {
                    digits.push(c);
                    cur.bump();
                } else {
                    break;
                }
            }
        }
        let value: f64 = digits
            .parse()
            .map_err(|_| cur.error_at(&start, "invalid number."))?;

        let mut unit = String::new();
        if cur.peek() == Some('%') {
            unit.push('%');
            cur.bump();
        } else {
            while let Some(c) = cur.peek() {
                if c.is_ascii_alphabetic() {
                    unit.push(c);
                    cur.bump();
                } else {
                    break;
                }
            }
        }
        Ok(Value::Number { value, unit })
    }

    fn serialize(&self) -> String {
        match self.style {
            OutputStyle::Expanded => {
                let rules: Vec<String> = self
                    .rules
                    .iter()
                    .map(|rule| {
                        let body: String = rule
                            .declarations
                            .iter()
                            .map(|(name, value)| format!("  {name}: {value};\n"))
                            .collect();
                        format!("{} {{\n{body}}}", rule.selector)
                    })
                    .collect();
                if rules.is_empty() {
                    String::new()
                } else {
                    format!("{}\n", rules.join("\n\n"))
                }
            }
            OutputStyle::Compressed => self
                .rules
                .iter()
                .map(|rule| {
                    let body: Vec<String> = rule
                        .declarations
                        .iter()
                        .map(|(name, value)| format!("{name}:{value}"))
                        .collect();
                    format!("{}{{{}}}", rule.selector, body.join(";"))
                })
                .collect(),
        }
    }

    fn apply_charset(&self, css: String) -> String {
        if !self.charset || css.is_ascii() {
            return css;
        }
        match self.style {
            OutputStyle::Expanded => format!("@charset \"UTF-8\";\n{css}"),
            OutputStyle::Compressed => format!("\u{feff}{css}"),
        }
    }

    fn build_source_map(&self) -> String {
        let sources: Vec<&str> = self.sources.iter().map(|(url, _)| url.as_str()).collect();
        let mut map = json!({
            "version": 3,
            "sourceRoot": "",
            "sources": sources,
            "names": [],
            "mappings": "",
        });
        if self.include_sources {
            let contents: Vec<&str> = self
                .sources
                .iter()
                .map(|(_, contents)| contents.as_str())
                .collect();
            map["sourcesContent"] = json!(contents);
        }
        map.to_string()
    }
}

fn apply_op(op: char, left: &Value, right: &Value) -> Result<Value, String> {
    use Value::*;
    match (op, left, right) {
        ('+', Str { text, quoted }, other) => Ok(Str {
            text: format!("{text}{}", plain_text(other)),
            quoted: *quoted,
        }),
        ('+', other, Str { text, quoted }) => Ok(Str {
            text: format!("{}{text}", plain_text(other)),
            quoted: *quoted,
        }),
        (
            '+' | '-',
            Number { value: l, unit: lu },
            Number { value: r, unit: ru },
        ) => {
            let unit = combine_linear_units(lu, ru)?;
            let value = if op == '+' { l + r } else { l - r };
            Ok(Number { value, unit })
        }
        ('*', Number { value: l, unit: lu }, Number { value: r, unit: ru }) => {
            if !lu.is_empty() && !ru.is_empty() {
                return Err(format!("Incompatible units {lu} and {ru}."));
            }
            Ok(Number {
                value: l * r,
                unit: if lu.is_empty() { ru.clone() } else { lu.clone() },
            })
        }
        ('/', Number { value: l, unit: lu }, Number { value: r, unit: ru }) => {
            if *r == 0.0 {
                return Err("Division by zero.".into());
            }
            let unit = if lu == ru {
                String::new()
            } else if ru.is_empty() {
                lu.clone()
            } else {
                return Err(format!("Incompatible units {lu} and {ru}."));
            };
            Ok(Number { value: l / r, unit })
        }
        _ => Err(format!(
            "Undefined operation \"{} {op} {}\".",
            render_value(left),
            render_value(right)
        )),
    }
}

fn combine_linear_units(left: &str, right: &str) -> Result<String, String> {
    if left == right || right.is_empty() {
        Ok(left.to_string())
    } else if left.is_empty() {
        Ok(right.to_string())
    } else {
        Err(format!("Incompatible units {left} and {right}."))
    }
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::Str { text, .. } => text.clone(),
        other => render_value(other),
    }
}

pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::Number { value, unit } => format!("{}{unit}", format_number(*value)),
        Value::Str { text, quoted: true } => format!("\"{}\"", text.replace('"', "\\\"")),
        Value::Str {
            text,
            quoted: false,
        } => text.clone(),
        Value::Bool(b) => b.to_string(),
    }
}

fn format_number(value: f64) -> String {
    let rounded = (value * 1e10).round() / 1e10;
    if rounded == rounded.trunc() && rounded.abs() < 1e15 {
        format!("{}", rounded as i64)
    } else {
        format!("{rounded}")
    }
}

struct Cursor<'s> {
    text: &'s str,
    url: Option<String>,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'s> Cursor<'s> {
    fn new(text: &'s str, url: Option<String>) -> Self {
        Self {
            text,
            url,
            pos: 0,
            line: 0,
            column: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.text[self.pos..].chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => return,
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn ident(&mut self) -> Option<String> {
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
            _ => return None,
        }
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Some(out)
    }

    fn expect(&mut self, expected: char) -> Result<(), EvalError> {
        if self.peek() == Some(expected) {
            self.bump();
            Ok(())
        } else {
            Err(self.error_here(&format!("expected \"{expected}\".")))
        }
    }

    fn location(&self) -> SourceLocation {
        SourceLocation {
            offset: self.pos as u32,
            line: self.line,
            column: self.column,
        }
    }

    fn context_at(&self, offset: usize) -> String {
        let begin = self.text[..offset.min(self.text.len())]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let end = self.text[begin..]
            .find('\n')
            .map(|i| begin + i)
            .unwrap_or(self.text.len());
        self.text[begin..end].to_string()
    }

    fn span_from(&self, start: &SourceLocation) -> SourceSpan {
        let end = self.location();
        SourceSpan {
            text: self.text[start.offset as usize..end.offset as usize].to_string(),
            start: Some(start.clone()),
            end: Some(end),
            url: self.url.clone().unwrap_or_default(),
            context: self.context_at(start.offset as usize),
        }
    }

    fn error_at(&self, start: &SourceLocation, message: &str) -> EvalError {
        EvalError {
            message: message.to_string(),
            span: self.span_from(start),
        }
    }

    fn error_here(&self, message: &str) -> EvalError {
        let start = self.location();
        EvalError {
            message: message.to_string(),
            span: self.span_from(&start),
        }
    }
}
