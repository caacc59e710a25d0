//! One export run: scan prior state, reconcile renames, then export each
//! conversation. Renames complete strictly before any attachment export, so
//! destination paths are always computed against the current names.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};

use eyre::{Context, Result, bail};
use tracing::{debug, info};

use crate::attachments::{AttachmentExporter, ExportStats};
use crate::config::ExportConfig;
use crate::dedup::DedupIndex;
use crate::previous;
use crate::render;
use crate::store::{self, ContactRegistry, ConversationRef, SignalStore};

pub fn execute(config: &ExportConfig) -> Result<()> {
    let key = store::read_cipher_key(&config.signal_dir)?;
    let store = SignalStore::open(&config.signal_dir, &key, &config.sqlcipher)?;
    let (own_number, device_id) = store.own_number()?;
    info!("Own number: {}, device ID: {}", own_number, device_id);

    let mut conversations = store.conversations()?;
    info!("Found {} conversations.", conversations.len());

    // Config-mapped contact names take precedence for private conversations,
    // so renaming a contact in the config reconciles like any other rename.
    for conversation in &mut conversations {
        if let Some(number) = &conversation.e164
            && let Some(name) = config.contacts.get(number)
        {
            conversation.display_name = name.clone();
            let sanitized = crate::sanitize::fs_name(name);
            conversation.fs_name = if sanitized.is_empty() {
                conversation.id.clone()
            } else {
                sanitized
            };
        }
    }
    check_name_collisions(&conversations)?;

    let contacts = build_contacts(&conversations, config);

    // Reconcile before anything is written: prior runs' output must end up
    // under the current names first.
    previous::rename_previous_conversations(
        &conversations,
        &config.output_dir,
        config.conversation_dirs,
    )?;

    fs::create_dir_all(&config.output_dir).wrap_err_with(|| {
        format!(
            "Failed to create output directory: {}",
            config.output_dir.display()
        )
    })?;
    let stylesheet = config.output_dir.join("style.css");
    if !stylesheet.exists() {
        fs::write(&stylesheet, render::DEFAULT_STYLESHEET)
            .wrap_err_with(|| format!("Failed to write {}", stylesheet.display()))?;
    }

    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();
    let mut message_budget = config.max_messages;

    for conversation in &conversations {
        if config.max_messages > 0 && message_budget == 0 {
            break;
        }
        let messages = store.media_messages(
            &conversation.id,
            &own_number,
            config.include_expiring,
            message_budget,
        )?;
        if messages.is_empty() {
            debug!("Skipping {} (no media messages)", conversation.display_name);
            continue;
        }
        if config.max_messages > 0 {
            message_budget -= messages.len() as u64;
        }
        stats.messages += messages.len();
        info!(
            "Exporting {} ({} messages)",
            conversation.display_name,
            messages.len()
        );

        let (base_dir, html_path, stylesheet_href) = if config.conversation_dirs {
            let dir = config.output_dir.join(&conversation.fs_name);
            fs::create_dir_all(&dir)
                .wrap_err_with(|| format!("Failed to create directory: {}", dir.display()))?;
            let html = dir.join("index.html");
            (dir, html, "../style.css")
        } else {
            let html = config
                .output_dir
                .join(format!("{}.html", conversation.fs_name));
            (config.output_dir.clone(), html, "style.css")
        };

        let exporter = AttachmentExporter::new(&base_dir, &config.signal_dir, &contacts);
        let file = File::create(&html_path)
            .wrap_err_with(|| format!("Failed to create: {}", html_path.display()))?;
        let mut writer = BufWriter::new(file);
        render::render_conversation(
            &mut writer,
            conversation,
            &messages,
            stylesheet_href,
            &exporter,
            &contacts,
            &mut dedup,
            &mut stats,
            config.max_attachments,
        )?;
        writer
            .flush()
            .wrap_err_with(|| format!("Failed to flush: {}", html_path.display()))?;
    }

    if stats.messages == 0 {
        bail!("No media messages found.");
    }

    info!(
        "Done. {} messages, {} media attachments [{:.1} MiB], {} attachments saved [{:.1} MiB], {} duplicates skipped.",
        stats.messages,
        stats.attachments,
        stats.attachments_size as f64 / (1 << 20) as f64,
        stats.saved_attachments,
        stats.saved_attachments_size as f64 / (1 << 20) as f64,
        stats.duplicates,
    );
    Ok(())
}

/// Distinct conversations may sanitize to the same filesystem name; that is
/// a user-visible error, never silently resolved.
fn check_name_collisions(conversations: &[ConversationRef]) -> Result<()> {
    let mut seen: HashMap<&str, &ConversationRef> = HashMap::new();
    for conversation in conversations {
        if let Some(other) = seen.insert(conversation.fs_name.as_str(), conversation) {
            bail!(
                "Conversations \"{}\" and \"{}\" both map to the file name \"{}\"; rename one of them",
                other.display_name,
                conversation.display_name,
                conversation.fs_name
            );
        }
    }
    Ok(())
}

fn build_contacts(conversations: &[ConversationRef], config: &ExportConfig) -> ContactRegistry {
    let mut contacts = ContactRegistry::new();
    for conversation in conversations {
        if let Some(number) = &conversation.e164 {
            contacts.insert(
                number.clone(),
                store::Contact {
                    id: Some(conversation.id.clone()),
                    display_name: conversation.display_name.clone(),
                    fs_name: conversation.fs_name.clone(),
                },
            );
        }
    }
    for (number, name) in &config.contacts {
        contacts.override_name(number, name);
    }
    contacts
}
