use std::collections::BTreeMap;

/// Parsed answers of the `envi` and `mntr` diagnostic commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    /// `envi`: server environment (`key=value` lines)
    pub environment: BTreeMap<String, String>,
    /// `mntr`: monitoring counters (`key<TAB>value` lines)
    pub monitor: BTreeMap<String, String>,
}

/// Parses newline-delimited `key=value` or `key<TAB>value` text.
///
/// A leading header line without any separator (e.g. `Environment:`) is skipped,
/// and each line is split on its first `=` or tab.
pub fn parse_diagnostic(text: &str) -> BTreeMap<String, String> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty()).peekable();
    if let Some(first) = lines.peek() {
        if split_entry(first).is_none() {
            lines.next();
        }
    }
    lines.filter_map(split_entry).collect()
}

fn split_entry(line: &str) -> Option<(String, String)> {
    let at = line.find(['=', '\t'])?;
    Some((line[..at].trim().to_string(), line[at + 1..].trim().to_string()))
}
