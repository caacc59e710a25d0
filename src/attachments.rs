//! Copying a single attachment out of the Signal profile.
//!
//! Ordinary data problems (not yet downloaded, file missing on disk) degrade
//! to a logged skip with an absent result; only unexpected I/O failures
//! propagate. The dedup index guarantees identical bytes land on disk at
//! most once, across senders and across runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use eyre::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::dedup::{self, DedupIndex};
use crate::previous::CONVERSATION_ID_MARKER;
use crate::sanitize::fs_name;
use crate::store::ContactRegistry;

/// One attachment reference inside a message's JSON blob.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Attachment {
    /// Relative path under `attachments.noindex`, absent until downloaded.
    pub path: Option<String>,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
    pub pending: bool,
    pub thumbnail: Option<Box<Attachment>>,
    pub screenshot: Option<Box<Attachment>>,
}

impl Attachment {
    pub fn is_visual_media(&self) -> bool {
        self.content_type.as_deref().is_some_and(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("image/") || ct.starts_with("video/") || ct.starts_with("audio/")
        })
    }
}

/// Running totals for one export run, owned by the orchestrator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExportStats {
    pub messages: usize,
    pub attachments: usize,
    pub attachments_size: u64,
    pub saved_attachments: usize,
    pub saved_attachments_size: u64,
    pub duplicates: usize,
}

/// Return the given attachment's extension (with leading dot).
///
/// Preference order: the original file name's extension, then the
/// content-type subtype with any `;`-delimited parameters stripped, then
/// nothing. The subtype is sanitized because values like `image/*` occur in
/// the wild (avatars in particular may also lack a content type entirely).
pub fn attachment_extension(att: &Attachment) -> String {
    if let Some(name) = att.file_name.as_deref()
        && let Some(ext) = Path::new(name).extension().and_then(|e| e.to_str())
        && !ext.is_empty()
    {
        return format!(".{ext}");
    }

    if let Some(content_type) = att.content_type.as_deref()
        && let Some(subtype) = content_type.split('/').nth(1)
    {
        let subtype = subtype
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if !subtype.is_empty() {
            return format!(".{}", fs_name(&subtype));
        }
    }

    String::new()
}

/// `signal-{sent}[-{idx}]{ext}`, the sibling index only when the message has
/// more than one attachment.
fn destination_file_name(
    att: &Attachment,
    sent_at: DateTime<Local>,
    sibling_index: usize,
    sibling_count: usize,
) -> String {
    let mut name = format!("signal-{}", sent_at.format("%Y-%m-%d-%H%M%S"));
    if sibling_count > 1 {
        name.push('-');
        name.push_str(&sibling_index.to_string());
    }
    name.push_str(&attachment_extension(att));
    name
}

/// Per-conversation attachment copier. The dedup index and stats are owned
/// by the orchestrator and injected into every call.
pub struct AttachmentExporter<'a> {
    base_dir: &'a Path,
    attachments_root: PathBuf,
    contacts: &'a ContactRegistry,
}

impl<'a> AttachmentExporter<'a> {
    pub fn new(base_dir: &'a Path, signal_dir: &Path, contacts: &'a ContactRegistry) -> Self {
        Self {
            base_dir,
            attachments_root: signal_dir.join("attachments.noindex"),
            contacts,
        }
    }

    /// Export a single attachment and return its relative destination path,
    /// or `None` when there is nothing to reference (not downloaded, source
    /// missing, or deduplicated against a differently-named file).
    #[allow(clippy::too_many_arguments)]
    pub fn export(
        &self,
        att: &Attachment,
        sender_number: &str,
        sent_at: DateTime<Local>,
        sibling_index: usize,
        sibling_count: usize,
        purpose_dir: &str,
        dedup: &mut DedupIndex,
        stats: &mut ExportStats,
    ) -> Result<Option<PathBuf>> {
        let contact = self.contacts.resolve(sender_number);
        let sender = contact.fs_name.as_str();
        let name = destination_file_name(att, sent_at, sibling_index, sibling_count);

        let att_path = match att.path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) if !att.pending => path,
            _ => {
                warn!("Skipping {}/{}/{} (media file not downloaded)", sender, purpose_dir, name);
                return Ok(None);
            }
        };

        // Databases written on Windows store backslash-separated paths.
        let src = self.attachments_root.join(att_path.replace('\\', "/"));

        let mut rel = PathBuf::from(sender);
        if purpose_dir != "." {
            rel.push(purpose_dir);
        }
        rel.push(&name);
        let dst = self.base_dir.join(&rel);

        let Ok(src_meta) = fs::metadata(&src) else {
            warn!("Skipping {}/{}/{} (media file not found)", sender, purpose_dir, name);
            return Ok(None);
        };

        stats.attachments += 1;
        stats.attachments_size += src_meta.len();

        let fingerprint = dedup::fingerprint_file(&src)
            .wrap_err_with(|| format!("Failed to fingerprint {}", src.display()))?;
        let duplicate_of = dedup
            .find_duplicate(fingerprint, &src)
            .wrap_err_with(|| format!("Failed to compare {} against saved files", src.display()))?
            .map(Path::to_path_buf);
        if let Some(prior) = duplicate_of {
            dedup.record(fingerprint, src);
            stats.duplicates += 1;
            if dst.exists() {
                // The duplicate is this very destination, written earlier.
                return Ok(Some(rel));
            }
            info!(
                "Skipping {} (already saved an identical file, source {})",
                rel.display(),
                prior.display()
            );
            return Ok(None);
        }

        if dst.exists() {
            // Left behind by a previous run; adopt it into the index.
            debug!("Skipping {} (file exists)", rel.display());
            dedup.record(fingerprint, src);
            return Ok(Some(rel));
        }

        self.ensure_sender_dir(sender, contact.id.as_deref())?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::copy(&src, &dst)
            .wrap_err_with(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
        set_file_times(&dst, sent_at);

        let size = fs::metadata(&dst).map(|m| m.len()).unwrap_or(src_meta.len());
        info!("Saved {} [{:.1} KiB]", dst.display(), size as f64 / 1024.0);
        stats.saved_attachments += 1;
        stats.saved_attachments_size += size;
        dedup.record(fingerprint, src);

        Ok(Some(rel))
    }

    /// Create the sender directory and drop the conversation-id marker the
    /// scanner relies on after renames. The marker holds the id of the
    /// sender's own conversation, when known.
    fn ensure_sender_dir(&self, sender: &str, contact_id: Option<&str>) -> Result<()> {
        let dir = self.base_dir.join(sender);
        fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("Failed to create sender directory: {}", dir.display()))?;
        let Some(id) = contact_id else {
            debug!("No conversation id known for sender {}; skipping marker", sender);
            return Ok(());
        };
        let marker = dir.join(CONVERSATION_ID_MARKER);
        if !marker.exists() {
            fs::write(&marker, id)
                .wrap_err_with(|| format!("Failed to write marker: {}", marker.display()))?;
        }
        Ok(())
    }
}

/// Stamp the destination with the message's sent time. Best-effort: some
/// filesystems and permission setups refuse this, and the copy still counts.
fn set_file_times(path: &Path, sent_at: DateTime<Local>) {
    let at = SystemTime::from(sent_at);
    let times = fs::FileTimes::new().set_accessed(at).set_modified(at);
    let outcome = fs::File::options()
        .write(true)
        .open(path)
        .and_then(|file| file.set_times(times));
    if let Err(err) = outcome {
        debug!("Could not set file times on {}: {}", path.display(), err);
    }
}
