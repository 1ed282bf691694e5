//! Parsers for the text formats the platform backends read. Kept free of
//! `cfg` gates so they are tested on every OS.

use std::path::Path;

use crate::monitor::ProcessInfo;

/// Final path component of an executable path, or the input unchanged
pub fn executable_basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Parse `ps -axo pid=,comm=` output
pub fn parse_ps_output(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            let command = command.trim();
            if command.is_empty() {
                return None;
            }
            Some(ProcessInfo::new(pid, executable_basename(command)))
        })
        .collect()
}

/// Parse `tasklist /FO CSV /NH` output
///
/// Each line looks like `"notepad.exe","4242","Console","1","12,345 K"`.
pub fn parse_tasklist_csv(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = split_quoted_csv(line.trim()).into_iter();
            let name = fields.next()?;
            let pid = fields.next()?.parse().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(ProcessInfo::new(pid, name))
        })
        .collect()
}

fn split_quoted_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !line.is_empty() {
        fields.push(current);
    }

    fields
}

/// Extract the display name from a freedesktop `.desktop` file
///
/// Only the `[Desktop Entry]` group counts. Entries marked `NoDisplay=true`
/// or `Hidden=true` are not user-facing applications and yield `None`.
pub fn parse_desktop_entry(content: &str) -> Option<String> {
    let mut in_entry = false;
    let mut name = None;

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "Name" if name.is_none() => name = Some(value.trim().to_string()),
            "NoDisplay" | "Hidden" if value.trim().eq_ignore_ascii_case("true") => return None,
            _ => {}
        }
    }

    name.filter(|n| !n.is_empty())
}
