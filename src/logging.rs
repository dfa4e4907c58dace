//! logfmt output on stderr: `level=.. ts=.. caller=.. msg=..` followed by
//! any key-values captured on the record.

use chrono::{DateTime, SecondsFormat, Utc};
use log::kv::{self, Key, Value, VisitSource};
use log::{LevelFilter, Record};
use std::fmt::Write as _;
use std::io::Write;

pub fn init() {
    let mut builder = env_logger::Builder::new();
    builder
        .target(env_logger::Target::Stderr)
        .filter_level(LevelFilter::Debug)
        .filter_module("reqwest", LevelFilter::Info)
        .parse_default_env()
        .format(|buf, record| writeln!(buf, "{}", render(record, Utc::now())));
    builder.init();
}

fn render(record: &Record<'_>, ts: DateTime<Utc>) -> String {
    let mut line = String::new();
    push_pair(&mut line, "level", &record.level().as_str().to_lowercase());
    push_pair(
        &mut line,
        "ts",
        &ts.to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    push_pair(&mut line, "caller", &caller(record));
    push_pair(&mut line, "msg", &record.args().to_string());

    let _ = record.key_values().visit(&mut Pairs(&mut line));
    line
}

fn caller(record: &Record<'_>) -> String {
    match (record.file(), record.line()) {
        (Some(file), Some(line)) => {
            let file = file.rsplit(['/', '\\']).next().unwrap_or(file);
            format!("{}:{}", file, line)
        }
        _ => record.target().to_string(),
    }
}

struct Pairs<'a>(&'a mut String);

impl<'kvs> VisitSource<'kvs> for Pairs<'_> {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), kv::Error> {
        push_pair(self.0, key.as_str(), &value.to_string());
        Ok(())
    }
}

fn push_pair(line: &mut String, key: &str, value: &str) {
    if !line.is_empty() {
        line.push(' ');
    }
    line.push_str(key);
    line.push('=');
    if needs_quotes(value) {
        push_quoted(line, value);
    } else {
        line.push_str(value);
    }
}

/// Quote when empty or holding a space, a control character, `=`, `"` or U+FFFD.
fn needs_quotes(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c <= ' ' || c == '=' || c == '"' || c == char::REPLACEMENT_CHARACTER)
}

fn push_quoted(line: &mut String, value: &str) {
    line.push('"');
    for c in value.chars() {
        match c {
            '"' => line.push_str("\\\""),
            '\\' => line.push_str("\\\\"),
            '\n' => line.push_str("\\n"),
            '\r' => line.push_str("\\r"),
            '\t' => line.push_str("\\t"),
            c if c < ' ' || c == '\u{2028}' || c == '\u{2029}' => {
                let _ = write!(line, "\\u{:04x}", c as u32);
            }
            c => line.push(c),
        }
    }
    line.push('"');
}
