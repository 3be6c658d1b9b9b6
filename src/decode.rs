//! Line decoder.
//!
//! Turns one raw log line into a [`LogRecord`]. Lines look like
//!
//! ```text
//! 2011-03-10 15:10:34,687 ERROR BaseXMLRPCServlet:110 - Error during XMLRPC request [3751531@http-436]
//! Jan 21 09:32:07 DEBUG: FragmentWriter:88 - insert_fragments_in_file: (subset 0) [3744]
//! ```
//!
//! Two modes are supported. [`DecodeMode::Extra`] applies a full anchored
//! pattern and keeps the message text and thread id. [`DecodeMode::Simple`]
//! only tokenises the leading timestamp, level and `File:line` fields, which
//! is much cheaper on large files.
//!
//! The result distinguishes three outcomes:
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `Ok(Some(record))` | a log record |
//! | `Ok(None)` | noise: the line does not have the shape of a record |
//! | `Err(Error::MalformedLine)` | the shape matched but a field did not parse |

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Duration, Month, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;

use crate::error::{Error, Result};
use crate::models::{DecodeMode, Level, LogRecord};

static RE_LOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        ^
        (?P<timestamp>
            \d{4}-\d{2}-\d{2} \s+ \d{2}:\d{2}:\d{2} (?:[,.]\d{1,6})?
          | [A-Za-z]{3} \s+ \d{1,2} \s+ \d{2}:\d{2}:\d{2} (?:[,.]\d{1,6})?
        )
        \s+
        (?P<level>[A-Z]+) :?
        \s+
        (?P<file>[\w.$]+) : (?P<line>\d+)
        \s+ - \s+
        (?P<content>.*?)
        \s*
        \[ (?P<thread>[^\[\]]+) \]
        \s* $
        ",
    )
    .expect("log line pattern is valid")
});

/// Decoder settings, derived from `[ingest]` in the config.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub mode: DecodeMode,
    pub content_max_len: usize,
    /// Year assumed for legacy `Mon DD HH:MM:SS` timestamps.
    pub legacy_year: i32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            mode: DecodeMode::Simple,
            content_max_len: 256,
            legacy_year: 2011,
        }
    }
}

/// Decode one line. See the module docs for the meaning of each outcome.
pub fn decode_line(line: &str, opts: &DecodeOptions) -> Result<Option<LogRecord>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    match opts.mode {
        DecodeMode::Extra => decode_extra(line, opts),
        DecodeMode::Simple => decode_simple(line, opts),
    }
}

/// Comment lines that may precede the first record of a file.
pub fn is_header_line(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn decode_extra(line: &str, opts: &DecodeOptions) -> Result<Option<LogRecord>> {
    let Some(caps) = RE_LOG_LINE.captures(line) else {
        return Ok(None);
    };

    let timestamp = parse_timestamp(&caps["timestamp"], opts.legacy_year)
        .map_err(|reason| malformed(line, reason))?;
    let level = Level::from_str(&caps["level"]).map_err(|reason| malformed(line, reason))?;
    let source_line = parse_source_line(&caps["line"]).map_err(|reason| malformed(line, reason))?;
    let content = truncate_chars(caps["content"].trim(), opts.content_max_len);

    Ok(Some(LogRecord {
        timestamp,
        level,
        source_file: caps["file"].to_string(),
        source_line,
        content: Some(content),
        thread_id: Some(caps["thread"].trim().to_string()),
    }))
}

fn decode_simple(line: &str, opts: &DecodeOptions) -> Result<Option<LogRecord>> {
    let tokens: Vec<&str> = line.split_whitespace().take(5).collect();
    if tokens.len() < 4 {
        return Ok(None);
    }

    let (timestamp_str, rest) = if looks_like_iso_date(tokens[0]) {
        (format!("{} {}", tokens[0], tokens[1]), &tokens[2..])
    } else if looks_like_legacy_date(tokens[0], tokens[1]) && tokens.len() >= 5 {
        (
            format!("{} {} {}", tokens[0], tokens[1], tokens[2]),
            &tokens[3..],
        )
    } else {
        return Ok(None);
    };

    let level_token = rest[0].trim_end_matches(':');
    let Ok(level) = Level::from_str(level_token) else {
        return Ok(None);
    };
    let Some((source_file, line_token)) = rest[1].rsplit_once(':') else {
        return Ok(None);
    };
    if source_file.is_empty()
        || line_token.is_empty()
        || !line_token.bytes().all(|b| b.is_ascii_digit())
    {
        return Ok(None);
    }

    let timestamp = parse_timestamp(&timestamp_str, opts.legacy_year)
        .map_err(|reason| malformed(line, reason))?;
    let source_line = parse_source_line(line_token).map_err(|reason| malformed(line, reason))?;

    Ok(Some(LogRecord {
        timestamp,
        level,
        source_file: source_file.to_string(),
        source_line,
        content: None,
        thread_id: None,
    }))
}

/// Parse either timestamp format. Fractions are decimal fractions of a second.
pub fn parse_timestamp(text: &str, legacy_year: i32) -> std::result::Result<NaiveDateTime, String> {
    let (main, fraction) = split_fraction(text.trim());
    let parts: Vec<&str> = main.split_whitespace().collect();

    let base = match parts.as_slice() {
        [date, time] => {
            let joined = format!("{} {}", date, time);
            NaiveDateTime::parse_from_str(&joined, "%Y-%m-%d %H:%M:%S")
                .map_err(|e| format!("bad timestamp '{}': {}", text, e))?
        }
        [month, day, time] => {
            let month = Month::from_str(month)
                .map_err(|_| format!("bad month in timestamp '{}'", text))?;
            let day: u32 = day
                .parse()
                .map_err(|_| format!("bad day in timestamp '{}'", text))?;
            let date = NaiveDate::from_ymd_opt(legacy_year, month.number_from_month(), day)
                .ok_or_else(|| format!("impossible date in timestamp '{}'", text))?;
            let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
                .map_err(|e| format!("bad time in timestamp '{}': {}", text, e))?;
            date.and_time(time)
        }
        _ => return Err(format!("unrecognised timestamp '{}'", text)),
    };

    match fraction {
        Some(digits) => Ok(base + Duration::microseconds(fraction_micros(digits)?)),
        None => Ok(base),
    }
}

fn split_fraction(text: &str) -> (&str, Option<&str>) {
    // The fraction separator can only follow the seconds field.
    match text.rfind([',', '.']) {
        Some(pos) if text[..pos].ends_with(|c: char| c.is_ascii_digit()) => {
            (&text[..pos], Some(&text[pos + 1..]))
        }
        _ => (text, None),
    }
}

fn fraction_micros(digits: &str) -> std::result::Result<i64, String> {
    if digits.is_empty() || digits.len() > 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("bad sub-second field '{}'", digits));
    }
    let value: i64 = digits
        .parse()
        .map_err(|_| format!("bad sub-second field '{}'", digits))?;
    Ok(value * 10_i64.pow(6 - digits.len() as u32))
}

fn parse_source_line(text: &str) -> std::result::Result<u32, String> {
    text.parse::<u32>()
        .map_err(|e| format!("bad source line '{}': {}", text, e))
}

fn looks_like_iso_date(token: &str) -> bool {
    let b = token.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

fn looks_like_legacy_date(month: &str, day: &str) -> bool {
    month.len() == 3
        && month.bytes().all(|b| b.is_ascii_alphabetic())
        && (1..=2).contains(&day.len())
        && day.bytes().all(|b| b.is_ascii_digit())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn malformed(line: &str, reason: String) -> Error {
    Error::MalformedLine {
        line: line.to_string(),
        reason,
    }
}
