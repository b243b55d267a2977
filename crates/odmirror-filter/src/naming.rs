//! Remote namespace naming rules.
//!
//! The remote service rejects a documented set of names and characters;
//! catching them before a transfer saves a round trip and a confusing
//! server error. Checks, in order: invalid characters, ASCII control
//! codes, bad leading/trailing whitespace, embedded HTML entity codes,
//! reserved names and prefixes.

/// Characters the remote namespace forbids anywhere in a name.
const INVALID_CHARS: &[char] = &['"', '*', ':', '<', '>', '?', '/', '\\', '|'];

/// Names the service reserves regardless of case.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM0", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
    "COM8", "COM9", "LPT0", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8",
    "LPT9", "desktop.ini",
];

/// Validates a single path segment against the remote naming rules.
///
/// Returns the reason the name is rejected, or `Ok(())` when it is
/// acceptable online.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".to_string());
    }

    if let Some(bad) = name.chars().find(|c| INVALID_CHARS.contains(c)) {
        return Err(format!("contains forbidden character '{bad}'"));
    }

    if let Some(ctrl) = name.chars().find(|c| (*c as u32) < 0x20 || *c == '\u{7f}') {
        return Err(format!("contains control character U+{:04X}", ctrl as u32));
    }

    if name != name.trim() {
        return Err("has leading or trailing whitespace".to_string());
    }

    if name.ends_with('.') {
        return Err("ends with a period".to_string());
    }

    if contains_html_entity_code(name) {
        return Err("contains an embedded HTML entity code".to_string());
    }

    let stem = name.split('.').next().unwrap_or(name);
    if RESERVED_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(name) || r.eq_ignore_ascii_case(stem))
    {
        return Err(format!("'{name}' is a reserved name"));
    }

    if name.starts_with("~$") {
        return Err("Office lock-file prefix '~$' is not allowed".to_string());
    }

    if name.contains("_vti_") {
        return Err("'_vti_' is not allowed in names".to_string());
    }

    Ok(())
}

/// Detects `&#NNN;`-style numeric entity codes, which the service
/// interprets and rewrites.
fn contains_html_entity_code(name: &str) -> bool {
    let bytes = name.as_bytes();
    let mut i = 0;
    while let Some(start) = find_from(bytes, b"&#", i) {
        let rest = &name[start + 2..];
        let digits: usize = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 && rest[digits..].starts_with(';') {
            return true;
        }
        i = start + 2;
    }
    false
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Validates every segment of a drive-relative path.
pub fn validate_path(path: &str) -> Result<(), String> {
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        validate_name(segment).map_err(|reason| format!("segment '{segment}': {reason}"))?;
    }
    Ok(())
}
