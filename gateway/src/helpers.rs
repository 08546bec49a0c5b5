//! Utility functions for the gateway.
//!
//! Range parsing, filename sanitizing, commit-log scraping for the landing
//! page, and small formatting helpers shared across handlers.

use std::process::Command;

use serde::Serialize;
use tracing::error;

// ============================================================================
// HTTP range parsing
// ============================================================================

/// Result of interpreting a `Range` header against a known file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No usable range: serve the whole file with `200 OK`.
    Full,
    /// Serve `[start, end]` inclusive with `206 Partial Content`.
    Partial { start: i64, end: i64 },
    /// The range lies outside the file: `416 Range Not Satisfiable`.
    Unsatisfiable,
}

/// Interpret a `Range: bytes=start-[end]` header.
///
/// An absent or unparseable header serves the full file. A parseable range
/// has its end clamped to `size - 1`; a start at or past the file end is
/// unsatisfiable. Multi-range requests are not supported and fall back to
/// the full file.
pub fn parse_range(header: Option<&str>, size: i64) -> RangeOutcome {
    if size <= 0 {
        return RangeOutcome::Full;
    }
    let Some(raw) = header else {
        return RangeOutcome::Full;
    };
    let Some(range) = raw.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if range.contains(',') {
        return RangeOutcome::Full;
    }
    let Some((start_str, end_str)) = range.split_once('-') else {
        return RangeOutcome::Full;
    };
    let Ok(start) = start_str.trim().parse::<i64>() else {
        return RangeOutcome::Full;
    };
    let end = if end_str.trim().is_empty() {
        size - 1
    } else {
        match end_str.trim().parse::<i64>() {
            Ok(end) => end.min(size - 1),
            Err(_) => return RangeOutcome::Full,
        }
    };
    if start > end || start >= size {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial { start, end }
}

/// Sanitize a filename for use in a `Content-Disposition` header.
///
/// Quotes, path separators and other delimiter characters become
/// underscores; control characters are dropped outright.
pub fn sanitize_filename(filename: &str) -> String {
    const MAX_FILENAME_LEN: usize = 255;

    let sanitized: String = filename
        .chars()
        .filter_map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' | ' ' => Some(c),
            c if c.is_control() => None,
            _ => Some('_'),
        })
        .collect();

    if sanitized.is_empty() {
        "download".to_string()
    } else if sanitized.len() > MAX_FILENAME_LEN {
        sanitized[..MAX_FILENAME_LEN].to_string()
    } else {
        sanitized
    }
}

/// Format a duration given in seconds the way the player page shows cookie
/// lifetimes: `90061` becomes `"25h1m1s"`, `45` stays `"45s"`.
pub fn format_duration_secs(total: u64) -> String {
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

// ============================================================================
// Landing-page commit log
// ============================================================================

const COMMIT_SEPARATOR: &str = "===";

/// One line of the landing page's recent-changes box.
#[derive(Debug, Clone, Serialize)]
pub struct Commit {
    pub date: String,
    pub message: String,
}

/// Read the last three commits of the checkout the gateway runs from.
///
/// Best-effort: deployments without a git checkout just get an empty list.
pub fn get_commits() -> Vec<Commit> {
    let output = match Command::new("git")
        .args([
            "log",
            "-3",
            &format!("--pretty=%cd{COMMIT_SEPARATOR}%s"),
            "--date=short",
        ])
        .output()
    {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            error!(status = %output.status, "git log failed");
            return Vec::new();
        }
        Err(error) => {
            error!(error = %error, "failed to run git log");
            return Vec::new();
        }
    };
    parse_commit_lines(&String::from_utf8_lossy(&output.stdout))
}

fn parse_commit_lines(raw: &str) -> Vec<Commit> {
    raw.lines()
        .filter_map(|line| {
            line.split_once(COMMIT_SEPARATOR).map(|(date, message)| Commit {
                date: date.to_string(),
                message: message.to_string(),
            })
        })
        .collect()
}
