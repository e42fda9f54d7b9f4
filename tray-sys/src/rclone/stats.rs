// SPDX-License-Identifier: GPL-3.0-only

//! Incremental parsing of `--stats-one-line` progress output
//!
//! rclone repaints its progress line with `\r`, so both `\r` and `\n` end a
//! line. A stats line looks like
//! `Transferred: 1.2 GiB / 2.6 GiB, 45%, 123.45M/s, ETA 2m30s`.

use tray_types::TransferProgress;

/// Bytes of unterminated output kept before the pending line is discarded
const MAX_PENDING: usize = 64 * 1024;

/// Splits a byte stream into complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, get back every line it completed. Blank lines are
    /// dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }

        if self.pending.len() > MAX_PENDING {
            tracing::debug!(
                "Discarding {} bytes of unterminated output",
                self.pending.len()
            );
            self.pending.clear();
        }

        lines
    }

    /// Whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Remove terminal escape sequences (`ESC [ ... final`)
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if ('@'..='~').contains(&next) {
                    break;
                }
            }
        } else {
            // two-byte sequence
            chars.next();
        }
    }
    out
}

/// Parse one line, `None` unless it is a complete stats line
///
/// The `ETA` field marks a stats line; the percentage is the last `%`
/// token before it and the rate is the field right after the percentage.
pub fn parse_stats_line(line: &str) -> Option<TransferProgress> {
    let line = strip_ansi(line);
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();

    let eta_index = fields.iter().position(|field| field.starts_with("ETA"))?;
    let eta = fields[eta_index]
        .strip_prefix("ETA")?
        .split_whitespace()
        .next()?
        .to_string();

    let percent_index = fields[..eta_index]
        .iter()
        .rposition(|field| percent_token(field).is_some())?;
    let percent = percent_token(fields[percent_index])?;

    let speed_index = percent_index + 1;
    if speed_index >= eta_index {
        return None;
    }
    let speed = fields[speed_index].to_string();
    if speed.is_empty() {
        return None;
    }

    Some(TransferProgress {
        percent,
        speed,
        eta,
    })
}

fn percent_token(field: &str) -> Option<u8> {
    let token = field.split_whitespace().last()?;
    let number = token.strip_suffix('%')?;
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.clamp(0.0, 100.0).round() as u8)
}
