//! # signal-media-export
//!
//! A CLI tool that exports media attachments and conversations from
//! [Signal Desktop](https://signal.org/download/) to a local directory of
//! browsable HTML files.
//!
//! ## What it does
//!
//! Signal Desktop keeps messages in a SQLCipher-encrypted SQLite database and
//! the attachment files under `attachments.noindex`. This tool reads the key
//! from the profile's `config.json`, opens the database **read-only**, and
//! writes one HTML document per conversation plus the referenced media files,
//! named after the message timestamps.
//!
//! ## Incremental export
//!
//! Runs are meant to be repeated. Identical media is copied at most once,
//! across senders and across runs: a cheap prefix fingerprint shortlists
//! candidates and a full SHA-256 comparison confirms them. When a
//! conversation or contact was renamed since the last run, the previously
//! exported files are moved to the new name instead of being exported again —
//! the conversation id embedded in each HTML document and a small marker file
//! in each sender directory are all the state this needs, so there is no
//! database of our own to corrupt or lose.
//!
//! ## Usage
//!
//! ```sh
//! # Export everything to a directory
//! signal-media-export ~/signal-backup
//!
//! # Custom profile location, one directory per conversation
//! signal-media-export ~/signal-backup --signal-dir ~/.config/Signal --conversation-dirs
//! ```
//!
//! Preferences can be persisted in `~/.config/signal-media-export/config.toml`.
//!
//! ## Compatibility
//!
//! Tracks Signal Desktop's internal (undocumented) SQLite schema. If a Signal
//! update breaks the queries, please open an issue.

pub mod attachments;
pub mod config;
pub mod dedup;
pub mod previous;
pub mod render;
pub mod run;
pub mod sanitize;
pub mod store;
