//! Table data blocks in PostgreSQL COPY text format.
//!
//! A block looks like:
//!
//! ```text
//! COPY public.products (product_id, name, price) FROM stdin;
//! 1	Widget A	19.99
//! \.
//! -- 1 rows
//! ```
//!
//! Rows are pulled from the snapshot one at a time and written straight to the artifact.

use crate::error::{BackupError, Result};
use crate::models::{quote_ident, Field, Row, Table};
use crate::services::artifact::ArtifactWriter;

use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Marker terminating a data block.
pub const END_OF_DATA: &str = "\\.";

/// Representation of SQL NULL.
pub const NULL_MARKER: &str = "\\N";

/// `COPY ... FROM stdin;` header for a table.
pub fn copy_statement(table: &Table) -> String {
    let columns: Vec<_> = table.data_columns().map(|c| quote_ident(&c.name)).collect();
    if columns.is_empty() {
        // A column-less table still has rows; each one is an empty line.
        return format!("COPY {} FROM stdin;", table.qualified_name());
    }
    format!("COPY {} ({}) FROM stdin;", table.qualified_name(), columns.join(", "))
}

/// Escape a text value for the COPY text format.
pub fn escape_text(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
}

/// Hex form of a binary value, as the server's `bytea` text output would print it.
pub fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

/// Serialize one field into `out`.
pub fn encode_field(field: &Field, out: &mut String) {
    match field {
        Field::Null => out.push_str(NULL_MARKER),
        Field::Text(value) => escape_text(value, out),
        Field::Binary(bytes) => escape_text(&encode_hex(bytes), out),
    }
}

/// Serialize a row, including the trailing newline, into `out`.
pub fn encode_row(row: &[Field], out: &mut String) {
    for (i, field) in row.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        encode_field(field, out);
    }
    out.push('\n');
}

/// Parse one line of a data block back into fields.
///
/// Binary columns come back as their `\x...` text form; use [`decode_hex`] on them.
pub fn decode_row(line: &str) -> Vec<Option<String>> {
    line.split('\t')
        .map(|raw| {
            if raw == NULL_MARKER {
                return None;
            }
            let mut value = String::with_capacity(raw.len());
            let mut chars = raw.chars();
            while let Some(c) = chars.next() {
                if c != '\\' {
                    value.push(c);
                    continue;
                }
                match chars.next() {
                    Some('t') => value.push('\t'),
                    Some('n') => value.push('\n'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => value.push('\\'),
                }
            }
            Some(value)
        })
        .collect()
}

/// Decode the `\x` hex form of a binary value.
pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Stream a table's rows into the artifact as one complete data block.
///
/// Each fetch is bounded by `fetch_timeout` and races the cancellation token. Returns
/// the number of rows written. On error the block is left unterminated, which is why
/// callers discard the artifact.
pub async fn stream_table<S, W>(
    table: &Table,
    rows: S,
    writer: &mut ArtifactWriter<W>,
    fetch_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: Stream<Item = Result<Row>>,
    W: AsyncWrite + Unpin,
{
    let label = table.label();
    let width = table.data_columns().count();

    let mut header = copy_statement(table);
    header.push('\n');
    writer.write_str(&header).await?;

    tokio::pin!(rows);
    let mut line = String::new();
    let mut count: u64 = 0;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            next = tokio::time::timeout(fetch_timeout, rows.next()) => next,
        };

        let row = match next {
            Err(_) => {
                return Err(BackupError::data_stream(
                    &label,
                    format!("no row received within {fetch_timeout:?}"),
                ))
            }
            Ok(None) => break,
            Ok(Some(row)) => row?,
        };

        if row.len() != width {
            return Err(BackupError::data_stream(
                &label,
                format!("expected {width} fields, got {}", row.len()),
            ));
        }

        line.clear();
        encode_row(&row, &mut line);
        writer.write_str(&line).await?;
        count += 1;
    }

    writer.write_str(&format!("{END_OF_DATA}\n-- {count} rows\n")).await?;
    tracing::debug!(table = %label, rows = count, "Wrote data block");
    Ok(count)
}
