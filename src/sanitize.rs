//! Turning arbitrary display names into filesystem-safe path segments.
//!
//! Windows is the restrictive platform here; see
//! <https://docs.microsoft.com/en-us/windows/win32/fileio/naming-a-file>.
//! Unix only forbids `/` and NUL, which the Windows rules already cover.

/// Return a variant of `name` usable as a single path segment on both
/// Windows and Unix.
///
/// Applied in order: `"` becomes `'`, every run of forbidden characters
/// collapses to a single `-`, reserved device names get a trailing `-`,
/// and trailing spaces and dots are stripped.
///
/// Two distinct inputs may map to the same output; callers that need
/// uniqueness must detect the collision themselves.
pub fn fs_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c == '"' {
            out.push('\'');
            in_run = false;
        } else if is_forbidden(c) {
            if !in_run {
                out.push('-');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    if is_reserved_device_name(&out) {
        out.push('-');
    }
    let trimmed = out.trim_end_matches([' ', '.']).len();
    out.truncate(trimmed);
    out
}

fn is_forbidden(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '/' | '\\' | '|' | '?' | '*') || (c as u32) < 0x20
}

/// `CON`, `PRN`, `AUX`, `NUL`, `COM1`-`COM9`, `LPT1`-`LPT9`,
/// case-insensitively. Windows refuses these as file names even with an
/// extension appended.
fn is_reserved_device_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    match upper.as_str() {
        "CON" | "PRN" | "AUX" | "NUL" => true,
        _ => {
            upper.len() == 4
                && (upper.starts_with("COM") || upper.starts_with("LPT"))
                && upper.as_bytes()[3].is_ascii_digit()
                && upper.as_bytes()[3] != b'0'
        }
    }
}
