//! Reduce raw failure output from external processes to short messages.

use std::io;
use std::sync::LazyLock;

use regex::Regex;

/// Longest message handed back to callers.
const MAX_MESSAGE_CHARS: usize = 300;

static MISSING_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:No module named|Cannot find module|cannot find package)\s+['"]?([\w./@-]+)"#)
        .unwrap()
});

static MISSING_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:command not found|No such file or directory|is not recognized as)").unwrap()
});

static TRACEBACK_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:Traceback \(most recent call last\)|\s+at\s+\S|\s+File\s+\x22|thread '.*' panicked at)")
        .unwrap()
});

/// Message for a spawn that failed before the process ran.
pub fn normalize_spawn_error(program: &str, err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => format!(
            "worker executable `{program}` was not found; install it or adjust worker.candidates"
        ),
        io::ErrorKind::PermissionDenied => {
            format!("worker executable `{program}` is not executable (permission denied)")
        }
        _ => truncate(&format!("failed to start `{program}`: {err}")),
    }
}

/// Normalize raw stderr or error text into one actionable line.
pub fn normalize_error_text(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "worker failed without an error message".to_string();
    }

    if let Some(caps) = MISSING_MODULE.captures(raw) {
        return format!(
            "worker is missing a dependency (`{}`); install the worker's requirements",
            &caps[1]
        );
    }

    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect();

    if lines.iter().any(|line| TRACEBACK_START.is_match(line)) {
        // The exception summary is the last line that is not a frame.
        let summary = lines
            .iter()
            .rev()
            .find(|line| !TRACEBACK_START.is_match(line) && !line.starts_with(' '))
            .copied()
            .unwrap_or(lines[lines.len() - 1]);
        return truncate(&format!("worker crashed: {}", summary.trim()));
    }

    if lines.len() == 1 && MISSING_COMMAND.is_match(lines[0]) {
        return truncate(&format!("worker command failed: {}", lines[0].trim()));
    }

    let head: Vec<&str> = lines.iter().take(2).map(|line| line.trim()).collect();
    truncate(&head.join(" "))
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        return message.to_string();
    }
    let mut cut: String = message.chars().take(MAX_MESSAGE_CHARS - 1).collect();
    cut.push('…');
    cut
}
