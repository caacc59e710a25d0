//! Read-only access to the Signal Desktop profile: the SQLCipher database and
//! the `config.json` holding its key.
//!
//! Tracks Signal Desktop's internal (undocumented) schema: conversations and
//! messages each carry a JSON blob with the interesting fields, alongside a
//! few indexed columns we can filter on.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use eyre::{Context, Result, bail, eyre};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;
use tracing::{info, warn};

use crate::attachments::Attachment;
use crate::sanitize::fs_name;

/// A conversation as enumerated from the store. `id` is stable across runs;
/// `display_name` (and therefore `fs_name`) may change between them.
#[derive(Clone, Debug)]
pub struct ConversationRef {
    pub id: String,
    pub display_name: String,
    pub fs_name: String,
    /// Phone number for private conversations, absent for groups.
    pub e164: Option<String>,
}

/// One message row, deserialized from the JSON blob. Only the fields the
/// exporter consumes; everything else in the blob is ignored.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MessageRecord {
    /// Epoch milliseconds. Absent in some (old or malformed) blobs.
    pub sent_at: Option<i64>,
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub quote: Option<Quote>,
    pub reactions: Vec<Reaction>,
    /// Shared contact cards, kept opaque and rendered as-is.
    pub contact: Vec<serde_json::Value>,
}

/// A quoted (replied-to) message: the quote author's number plus the text.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Quote {
    pub author: Option<String>,
    pub text: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub from_id: String,
}

/// A known sender: the id of their own (private) conversation plus the names
/// derived from it or overridden in the config.
#[derive(Clone, Debug)]
pub struct Contact {
    pub id: Option<String>,
    pub display_name: String,
    pub fs_name: String,
}

/// Phone number → contact lookup with a synthesized fallback, so an unmapped
/// number still exports under a (sanitized) directory of its own.
#[derive(Debug, Default)]
pub struct ContactRegistry {
    by_number: HashMap<String, Contact>,
}

impl ContactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, number: String, contact: Contact) {
        self.by_number.insert(number, contact);
    }

    /// Replace the display name for `number`, keeping the conversation id if
    /// one was already known.
    pub fn override_name(&mut self, number: &str, display_name: &str) {
        let id = self
            .by_number
            .get(number)
            .and_then(|contact| contact.id.clone());
        self.by_number.insert(
            number.to_string(),
            Contact {
                id,
                display_name: display_name.to_string(),
                fs_name: fs_name(display_name),
            },
        );
    }

    pub fn resolve(&self, number: &str) -> Contact {
        self.by_number.get(number).cloned().unwrap_or_else(|| Contact {
            id: None,
            display_name: number.to_string(),
            fs_name: fs_name(number),
        })
    }
}

/// Read the SQLCipher key from `{signalDir}/config.json`.
pub fn read_cipher_key(signal_dir: &Path) -> Result<String> {
    #[derive(Deserialize)]
    struct SignalConfig {
        key: String,
    }

    let path = signal_dir.join("config.json");
    let content = fs::read_to_string(&path)
        .wrap_err_with(|| format!("Failed to read Signal config: {}", path.display()))?;
    let config: SignalConfig = serde_json::from_str(&content)
        .wrap_err_with(|| format!("Failed to parse Signal config: {}", path.display()))?;

    if config.key.is_empty() || !config.key.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("Key in {} is not a hex string", path.display());
    }
    info!("Read sqlcipher key: 0x{}...", &config.key[..8.min(config.key.len())]);
    Ok(config.key)
}

fn apply_pragma(conn: &Connection, statement: &str) -> rusqlite::Result<()> {
    conn.query_row(statement, [], |_row| Ok(()))
        .optional()
        .map(|_| ())
}

pub struct SignalStore {
    conn: Connection,
}

impl SignalStore {
    /// Open `sql/db.sqlite` read-only and apply the key plus any configured
    /// cipher pragmas. Fails early with a hint if the key or parameters do
    /// not decrypt the database.
    pub fn open(
        signal_dir: &Path,
        key: &str,
        sqlcipher: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let db_path = signal_dir.join("sql/db.sqlite");
        if !db_path.exists() {
            bail!(
                "Database not found at: {}\nUse --signal-dir to point at the Signal profile.",
                db_path.display()
            );
        }

        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .wrap_err_with(|| format!("Failed to open database: {}", db_path.display()))?;

        // Newer sqlcipher answers `PRAGMA key` with an "ok" row, older ones
        // with nothing; tolerate both.
        apply_pragma(&conn, &format!("PRAGMA key=\"x'{key}'\""))
            .wrap_err("Failed to apply sqlcipher key")?;
        for (setting, value) in sqlcipher {
            apply_pragma(&conn, &format!("PRAGMA {setting}={value}"))
                .wrap_err_with(|| format!("Failed to apply PRAGMA {setting}={value}"))?;
        }

        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .wrap_err("Could not read the database - please check the key and the sqlcipher parameters")?;

        Ok(Self { conn })
    }

    /// The account's own number and device id, from the `number_id` item.
    /// Outgoing messages may lack a `source`; this is what they get attributed to.
    pub fn own_number(&self) -> Result<(String, String)> {
        #[derive(Deserialize)]
        struct NumberId {
            value: String,
        }

        let json: String = self
            .conn
            .query_row("SELECT json FROM items WHERE id = ?1", ["number_id"], |row| {
                row.get(0)
            })
            .wrap_err("Failed to read own number from the items table")?;
        let item: NumberId = serde_json::from_str(&json).wrap_err("Failed to parse number_id item")?;
        let (number, device_id) = item
            .value
            .split_once('.')
            .ok_or_else(|| eyre!("Unexpected number_id format: {:?}", item.value))?;
        Ok((number.to_string(), device_id.to_string()))
    }

    /// Enumerate conversations, most recently active first. Conversations
    /// whose JSON cannot be parsed are skipped with a warning.
    pub fn conversations(&self) -> Result<Vec<ConversationRef>> {
        #[derive(Default, Deserialize)]
        #[serde(default, rename_all = "camelCase")]
        struct ConversationDetails {
            name: Option<String>,
            profile_name: Option<String>,
            e164: Option<String>,
        }

        let mut stmt = self
            .conn
            .prepare("SELECT id, json FROM conversations ORDER BY active_at DESC")
            .wrap_err("Failed to prepare conversations query")?;
        let mut rows = stmt
            .query([])
            .wrap_err("Failed to query conversations")?;

        let mut conversations = Vec::new();
        while let Some(row) = rows.next().wrap_err("Failed to read conversation row")? {
            let id: String = row.get(0)?;
            let json: String = row.get(1)?;
            let details: ConversationDetails = match serde_json::from_str(&json) {
                Ok(details) => details,
                Err(err) => {
                    warn!("Skipping conversation {} (unparsable JSON: {})", id, err);
                    continue;
                }
            };

            let display_name = details
                .name
                .filter(|name| !name.is_empty())
                .or(details.profile_name.filter(|name| !name.is_empty()))
                .or_else(|| details.e164.clone())
                .unwrap_or_else(|| id.clone());
            let mut name = fs_name(&display_name);
            if name.is_empty() {
                name = id.clone();
            }
            conversations.push(ConversationRef {
                id,
                display_name,
                fs_name: name,
                e164: details.e164,
            });
        }
        Ok(conversations)
    }

    /// Messages of one conversation that carry visual media, oldest first.
    /// `limit` of 0 means no limit. Outgoing messages without a `source` are
    /// attributed to `own_number`.
    pub fn media_messages(
        &self,
        conversation_id: &str,
        own_number: &str,
        include_expiring: bool,
        limit: u64,
    ) -> Result<Vec<MessageRecord>> {
        let mut sql = String::from(
            "SELECT json FROM messages \
             WHERE conversationId = ?1 AND hasVisualMediaAttachments > 0",
        );
        if !include_expiring {
            sql.push_str(" AND expires_at IS NULL");
        }
        sql.push_str(" ORDER BY sent_at ASC");
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .wrap_err("Failed to prepare messages query")?;
        let mut rows = stmt
            .query([conversation_id])
            .wrap_err("Failed to query messages")?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().wrap_err("Failed to read message row")? {
            let json: String = row.get(0)?;
            let mut msg: MessageRecord = match serde_json::from_str(&json) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(
                        "Skipping a message in conversation {} (unparsable JSON: {})",
                        conversation_id, err
                    );
                    continue;
                }
            };
            if msg.source.is_none() && msg.kind == "outgoing" {
                msg.source = Some(own_number.to_string());
            }
            messages.push(msg);
        }
        Ok(messages)
    }
}
