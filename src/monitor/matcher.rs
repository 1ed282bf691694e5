use serde::{Deserialize, Serialize};

/// Decides whether a running process belongs to a protected application
pub trait MatchStrategy: Send + Sync {
    fn matches(&self, app_identifier: &str, process_name: &str) -> bool;
}

/// Which matching strategy the monitor uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    #[default]
    Heuristic,
    Exact,
}

impl MatcherKind {
    pub fn build(self) -> Box<dyn MatchStrategy> {
        match self {
            MatcherKind::Heuristic => Box::new(HeuristicMatcher),
            MatcherKind::Exact => Box::new(ExactMatcher),
        }
    }
}

/// Well-known applications whose executable shares no long word with the
/// display name, or which users commonly name by brand
const WELL_KNOWN: &[(&str, &str)] = &[
    ("chrome", "chrome.exe"),
    ("firefox", "firefox.exe"),
    ("notepad", "notepad.exe"),
    ("calculator", "calc.exe"),
    ("paint", "mspaint.exe"),
    ("steam", "steam.exe"),
    ("discord", "discord.exe"),
    ("spotify", "spotify.exe"),
    ("skype", "skype.exe"),
    ("zoom", "zoom.exe"),
];

/// Words shorter than this never match on their own
const MIN_WORD_LEN: usize = 4;

/// Loose matching on display names
///
/// A process matches if it contains any word of four or more letters from
/// the application name (`"Google Chrome"` matches `chrome.exe`), or if the
/// application name mentions a well-known key and the process is that key's
/// executable (`"Calculator"` matches `calc.exe`, and `calc` on systems
/// without the `.exe` suffix).
pub struct HeuristicMatcher;

impl MatchStrategy for HeuristicMatcher {
    fn matches(&self, app_identifier: &str, process_name: &str) -> bool {
        let app = app_identifier.to_lowercase();
        let process = process_name.to_lowercase();

        if app
            .split_whitespace()
            .any(|word| word.chars().count() >= MIN_WORD_LEN && process.contains(word))
        {
            return true;
        }

        WELL_KNOWN.iter().any(|(key, exe)| {
            app.contains(key) && (process == *exe || Some(process.as_str()) == exe.strip_suffix(".exe"))
        })
    }
}

/// The executable name must equal the application identifier, ignoring case
/// and a trailing `.exe`
pub struct ExactMatcher;

impl MatchStrategy for ExactMatcher {
    fn matches(&self, app_identifier: &str, process_name: &str) -> bool {
        strip_exe(app_identifier.trim()).eq_ignore_ascii_case(strip_exe(process_name))
    }
}

fn strip_exe(name: &str) -> &str {
    let len = name.len();
    if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
        &name[..len - 4]
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_matches_long_words() {
        let m = HeuristicMatcher;
        assert!(m.matches("Notepad", "notepad.exe"));
        assert!(m.matches("Google Chrome", "chrome.exe"));
        assert!(m.matches("Mozilla Firefox", "firefox"));
        assert!(m.matches("Visual Studio Code", "Code.exe"));
        assert!(!m.matches("Notepad", "explorer.exe"));
    }

    #[test]
    fn heuristic_ignores_short_words() {
        let m = HeuristicMatcher;
        // "vlc" and "the" are too short to match on their own
        assert!(!m.matches("VLC", "vlc.exe"));
        assert!(!m.matches("The Sims", "theater.exe"));
    }

    #[test]
    fn heuristic_well_known_table() {
        let m = HeuristicMatcher;
        assert!(m.matches("Calculator", "calc.exe"));
        assert!(m.matches("Windows Calculator", "CALC.EXE"));
        assert!(m.matches("Calculator", "calc"));
        assert!(m.matches("MS Paint", "mspaint.exe"));
        assert!(!m.matches("Calculator", "calcium.exe"));
    }

    #[test]
    fn exact_requires_equal_names() {
        let m = ExactMatcher;
        assert!(m.matches("notepad", "notepad.exe"));
        assert!(m.matches("Notepad", "NOTEPAD.EXE"));
        assert!(m.matches("firefox", "firefox"));
        assert!(m.matches("steam.exe", "steam"));
        assert!(!m.matches("Google Chrome", "chrome.exe"));
        assert!(!m.matches("note", "notepad.exe"));
    }

    #[test]
    fn matcher_kind_builds_strategy() {
        assert!(MatcherKind::Heuristic.build().matches("Google Chrome", "chrome"));
        assert!(!MatcherKind::Exact.build().matches("Google Chrome", "chrome"));
    }
}
