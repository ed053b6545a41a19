//! Multi-line payload handling for migration templates.
//!
//! A `[=[ ... ]=]` block (or the deeper `[==[ ... ]==]` and
//! `[===[ ... ]===]` forms) carries an opaque payload: procedure bodies,
//! seed data, documentation. The block is extracted, stripped of its common
//! leading indentation, base64 encoded, and wrapped in the target engine's
//! decode expression. Payloads over the compression threshold are Brotli
//! compressed first and marked so the wrapper decompresses.

#![allow(
    clippy::string_slice,
    clippy::indexing_slicing,
    reason = "offsets come from find() on the same text and are boundary-safe"
)]

use std::io::Write;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::engine::EngineTag;

use super::MigrateError;

/// Payloads larger than this are compressed before encoding.
const COMPRESSION_THRESHOLD: usize = 1024;
/// Brotli quality; maximum, since migrations render once.
const BROTLI_QUALITY: u32 = 11;
const BROTLI_LGWIN: u32 = 22;

/// Bracket levels, deepest first so `[==[` is never misread as `[=[`.
const LEVELS: [(&str, &str); 3] = [("[===[", "]===]"), ("[==[", "]==]"), ("[=[", "]=]")];

/// Replace every payload block in `sql` with the engine's decode
/// expression over the encoded payload. `source` names the migration file
/// the template came from, for error reporting.
///
/// # Errors
/// [`MigrateError::CompressionUnavailable`] when a payload requires
/// compression and the encoder fails, and [`MigrateError::Source`] for an
/// unclosed block.
pub fn encode_payloads(
    sql: &str,
    engine: EngineTag,
    source: &Path,
) -> Result<String, MigrateError> {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    loop {
        let Some((start, level)) = next_opener(rest) else {
            out.push_str(rest);
            return Ok(out);
        };
        let (open, close) = LEVELS[level];
        out.push_str(&rest[..start]);
        let body_start = start + open.len();
        let Some(end) = rest[body_start..].find(close) else {
            return Err(MigrateError::Source {
                path: source.to_path_buf(),
                cause: format!("unterminated {open} payload block"),
            });
        };
        let body = &rest[body_start..body_start + end];
        out.push_str(&encode_one(body, engine)?);
        rest = &rest[body_start + end + close.len()..];
    }
}

fn next_opener(text: &str) -> Option<(usize, usize)> {
    LEVELS
        .iter()
        .enumerate()
        .filter_map(|(level, (open, _))| text.find(open).map(|at| (at, level)))
        .min_by_key(|(at, _)| *at)
}

fn encode_one(body: &str, engine: EngineTag) -> Result<String, MigrateError> {
    let stripped = dedent(body);
    let bytes = stripped.as_bytes();
    let (data, compressed) = if bytes.len() > COMPRESSION_THRESHOLD {
        (compress(bytes)?, true)
    } else {
        (bytes.to_vec(), false)
    };
    let encoded = BASE64.encode(data);
    Ok(wrap(engine, &encoded, compressed))
}

fn compress(bytes: &[u8]) -> Result<Vec<u8>, MigrateError> {
    let mut out = Vec::new();
    {
        let mut writer =
            brotli::CompressorWriter::new(&mut out, 4096, BROTLI_QUALITY, BROTLI_LGWIN);
        writer
            .write_all(bytes)
            .map_err(|e| MigrateError::CompressionUnavailable(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| MigrateError::CompressionUnavailable(e.to_string()))?;
    }
    Ok(out)
}

/// The engine-specific decode expression around an encoded payload. The
/// compressed variant layers the decompression function so the marker
/// travels in the SQL itself.
fn wrap(engine: EngineTag, encoded: &str, compressed: bool) -> String {
    match (engine, compressed) {
        (EngineTag::Postgres, false) => {
            format!("CONVERT_FROM(DECODE('{encoded}', 'base64'), 'UTF8')")
        }
        (EngineTag::Postgres, true) => {
            format!("CONVERT_FROM(BROTLI_DECODE(DECODE('{encoded}', 'base64')), 'UTF8')")
        }
        (EngineTag::Mysql, false) => format!("CONVERT(FROM_BASE64('{encoded}') USING utf8mb4)"),
        (EngineTag::Mysql, true) => {
            format!("CONVERT(BROTLI_DECODE(FROM_BASE64('{encoded}')) USING utf8mb4)")
        }
        (EngineTag::Sqlite, false) => format!("CRYPTO_DECODE('{encoded}', 'base64')"),
        (EngineTag::Sqlite, true) => {
            format!("BROTLI_DECODE(CRYPTO_DECODE('{encoded}', 'base64'))")
        }
        (EngineTag::Db2, false) => format!("BASE64DECODE('{encoded}')"),
        (EngineTag::Db2, true) => format!("BROTLI_DECODE(BASE64DECODE('{encoded}'))"),
    }
}

/// Strip the common leading indentation of every non-empty line, plus one
/// leading and trailing newline when present.
fn dedent(body: &str) -> String {
    let body = body.strip_prefix('\n').unwrap_or(body);
    let body = body.strip_suffix('\n').unwrap_or(body);
    let indent = body
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    body.lines()
        .map(|line| if line.len() >= indent { &line[indent..] } else { line.trim_start() })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Re-indent rendered SQL for readability: each line outside a quoted
/// literal is indented by its parenthesis depth. Content inside quoted
/// literals is never touched.
#[must_use]
pub fn reindent(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut depth: usize = 0;
    let mut in_quote: Option<char> = None;
    let mut lines = sql.lines().peekable();
    while let Some(line) = lines.next() {
        if in_quote.is_some() {
            // Mid-literal lines pass through verbatim.
            out.push_str(line);
        } else {
            let trimmed = line.trim();
            let leading_closers = trimmed
                .chars()
                .take_while(|c| *c == ')')
                .count();
            let effective = depth.saturating_sub(leading_closers);
            if !trimmed.is_empty() {
                for _ in 0..effective {
                    out.push_str("    ");
                }
            }
            out.push_str(trimmed);
        }
        scan_line(line, &mut depth, &mut in_quote);
        if lines.peek().is_some() {
            out.push('\n');
        }
    }
    out
}

fn scan_line(line: &str, depth: &mut usize, in_quote: &mut Option<char>) {
    for ch in line.chars() {
        if let Some(q) = *in_quote {
            if ch == q {
                *in_quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' => *in_quote = Some(ch),
            '(' => *depth += 1,
            ')' => *depth = depth.saturating_sub(1),
            _ => {}
        }
    }
}
