use std::collections::BTreeMap;
use std::path::PathBuf;

/// Fully resolved configuration for one export run.
/// This decouples the logic from how the arguments were parsed (CLI/Config file).
#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    pub signal_dir: PathBuf,
    /// Export media for at most this many messages in total; 0 = no limit.
    pub max_messages: u64,
    /// Stop exporting attachments once this many have been seen; 0 = no limit.
    pub max_attachments: u64,
    pub include_expiring: bool,
    /// One directory per conversation with an `index.html` inside, instead of
    /// `{name}.html` files next to sender directories.
    pub conversation_dirs: bool,
    /// Phone number (normalized) to display name overrides.
    pub contacts: BTreeMap<String, String>,
    /// Extra `PRAGMA` settings applied after the key, e.g. `cipher_compatibility`.
    pub sqlcipher: BTreeMap<String, String>,
}

/// Strip everything but `+` and digits, so config keys match the `e164`
/// numbers stored in the database regardless of spacing or dashes.
pub fn normalize_phone_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c == '+' || c.is_ascii_digit())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_numbers_lose_formatting() {
        assert_eq!(normalize_phone_number("+49 171 123-4567"), "+491711234567");
        assert_eq!(normalize_phone_number("(030) 12 34 56"), "030123456");
        assert_eq!(normalize_phone_number("+1234"), "+1234");
    }
}
