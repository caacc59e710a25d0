//! Reconstructing prior runs from the output tree, and renaming their
//! artifacts when a conversation's display name changed.
//!
//! Nothing about previous runs is persisted anywhere else: the conversation
//! id embedded in each index document and the marker file in each sender
//! directory are the only correlation keys, which is what makes recovery
//! work even after an interrupted rename batch.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use eyre::{Context, Result, bail, eyre};
use tracing::info;

use crate::store::ConversationRef;

/// Name of the marker file written into every sender directory.
pub const CONVERSATION_ID_MARKER: &str = "conversationId.txt";

/// The marker attribute on the `<html>` root of every index document.
/// Must stay stable across versions; the scanner reads trees written by
/// older runs.
const MARKER_ATTR: &str = "data-conversation-id=\"";

/// The marker attribute sits in the opening tag, so a bounded prefix read is
/// enough; never parse the whole document.
const MARKER_SCAN_LEN: usize = 4096;

/// What earlier runs left behind for one conversation id.
#[derive(Clone, Debug, Default)]
pub struct PreviousConversation {
    pub fs_name: String,
    /// The index document (flat mode) or the conversation directory.
    /// At most one per id; finding two is ambiguous prior state.
    pub conversation_path: Option<PathBuf>,
    /// Sender directories carrying this id's marker file.
    pub sender_paths: Vec<PathBuf>,
}

/// Bounded search for the conversation id embedded in an index document.
/// Returns early once found; `None` when the document carries no marker.
pub fn read_conversation_id(html_path: &Path) -> io::Result<Option<String>> {
    let mut file = File::open(html_path)?;
    let mut buf = vec![0u8; MARKER_SCAN_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let head = String::from_utf8_lossy(&buf[..filled]);

    let Some(start) = head.find(MARKER_ATTR) else {
        return Ok(None);
    };
    let rest = &head[start + MARKER_ATTR.len()..];
    Ok(rest
        .find('"')
        .map(|end| rest[..end].to_string())
        .filter(|id| !id.is_empty()))
}

/// Reconstruct, from the destination tree alone, which conversation ids were
/// exported by earlier runs and under which filesystem names.
pub fn scan_previous_exports(
    output_dir: &Path,
    conversation_dirs: bool,
) -> Result<HashMap<String, PreviousConversation>> {
    let mut found: HashMap<String, PreviousConversation> = HashMap::new();
    if !output_dir.is_dir() {
        return Ok(found);
    }

    // Conversation-level artifacts first.
    if conversation_dirs {
        for dir in subdirectories(output_dir)? {
            let index = dir.join("index.html");
            if !index.is_file() {
                continue;
            }
            let id = read_conversation_id(&index)
                .wrap_err_with(|| format!("Failed to read {}", index.display()))?;
            if let Some(id) = id {
                let name = segment_name(&dir)?;
                insert_conversation_path(&mut found, id, name, dir)?;
            }
        }
    } else {
        for entry in fs::read_dir(output_dir)
            .wrap_err_with(|| format!("Failed to read {}", output_dir.display()))?
        {
            let path = entry.wrap_err("Failed to read directory entry")?.path();
            if !path.is_file() || path.extension() != Some(OsStr::new("html")) {
                continue;
            }
            let id = read_conversation_id(&path)
                .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
            if let Some(id) = id {
                let name = path
                    .file_stem()
                    .and_then(OsStr::to_str)
                    .ok_or_else(|| eyre!("Unrepresentable file name: {}", path.display()))?
                    .to_string();
                insert_conversation_path(&mut found, id, name, path)?;
            }
        }
    }

    // Then sender directories, recognized by their marker file. In
    // conversation-dirs mode they nest one level deeper.
    let sender_dirs = if conversation_dirs {
        let mut dirs = Vec::new();
        for conversation_dir in subdirectories(output_dir)? {
            dirs.extend(subdirectories(&conversation_dir)?);
        }
        dirs
    } else {
        subdirectories(output_dir)?
    };

    for dir in sender_dirs {
        let marker = dir.join(CONVERSATION_ID_MARKER);
        if !marker.is_file() {
            continue;
        }
        let id = fs::read_to_string(&marker)
            .wrap_err_with(|| format!("Failed to read {}", marker.display()))?
            .trim()
            .to_string();
        if id.is_empty() {
            continue;
        }
        let name = segment_name(&dir)?;
        match found.entry(id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if name != record.fs_name {
                    bail!(
                        "Found two previously exported conversations or senders with the same ID: {} and {}",
                        record.fs_name,
                        name
                    );
                }
                record.sender_paths.push(dir);
            }
            Entry::Vacant(entry) => {
                entry.insert(PreviousConversation {
                    fs_name: name,
                    conversation_path: None,
                    sender_paths: vec![dir],
                });
            }
        }
    }

    Ok(found)
}

/// Compare the current conversation list against the scanned prior state and
/// move everything whose filesystem name changed, in place.
///
/// Sender directories move first: they may live inside a conversation
/// directory that is itself about to move, and renaming the parent first
/// would invalidate their recorded paths. Each individual move is a rename
/// (metadata-only on one volume), checked against an existing destination
/// before it runs; an interrupted batch leaves a tree the next scan can
/// still correlate by id.
pub fn rename_previous_conversations(
    current: &[ConversationRef],
    output_dir: &Path,
    conversation_dirs: bool,
) -> Result<()> {
    let previous = scan_previous_exports(output_dir, conversation_dirs)?;

    for conversation in current {
        let Some(old) = previous.get(&conversation.id) else {
            continue;
        };
        if conversation.fs_name == old.fs_name || old.sender_paths.is_empty() {
            continue;
        }
        info!(
            "Renaming sender \"{}\" to \"{}\"",
            old.fs_name, conversation.fs_name
        );
        for old_path in &old.sender_paths {
            move_renamed(old_path, &old.fs_name, &conversation.fs_name)?;
        }
    }

    for conversation in current {
        let Some(old) = previous.get(&conversation.id) else {
            continue;
        };
        if conversation.fs_name == old.fs_name {
            continue;
        }
        if let Some(old_path) = &old.conversation_path {
            info!(
                "Renaming conversation \"{}\" to \"{}\"",
                old.fs_name, conversation.fs_name
            );
            move_renamed(old_path, &old.fs_name, &conversation.fs_name)?;
        }
    }

    Ok(())
}

fn move_renamed(old_path: &Path, old_name: &str, new_name: &str) -> Result<()> {
    let new_path = replace_rightmost_segment(old_path, old_name, new_name).ok_or_else(|| {
        eyre!(
            "No path segment named \"{}\" in {}",
            old_name,
            old_path.display()
        )
    })?;
    // lexists: a dangling symlink at the destination still blocks the move.
    if new_path.symlink_metadata().is_ok() {
        bail!(
            "Cannot rename \"{}\" to \"{}\": destination already exists",
            old_path.display(),
            new_path.display()
        );
    }
    fs::rename(old_path, &new_path).wrap_err_with(|| {
        format!(
            "Failed to rename \"{}\" to \"{}\"",
            old_path.display(),
            new_path.display()
        )
    })
}

/// Replace the rightmost path segment equal to `old` (or `old` plus an
/// extension, for index files) with `new`. Segment-aware on purpose: a
/// textual rightmost-substring would misfire when the old name happens to
/// occur inside an ancestor directory name.
fn replace_rightmost_segment(path: &Path, old: &str, new: &str) -> Option<PathBuf> {
    let segments: Vec<&OsStr> = path.iter().collect();
    for i in (0..segments.len()).rev() {
        let Some(segment) = segments[i].to_str() else {
            continue;
        };
        let replacement = if segment == old {
            new.to_string()
        } else if let Some(rest) = segment.strip_prefix(old) {
            if !rest.starts_with('.') {
                continue;
            }
            format!("{new}{rest}")
        } else {
            continue;
        };

        let mut out = PathBuf::new();
        for (j, seg) in segments.iter().enumerate() {
            if j == i {
                out.push(&replacement);
            } else {
                out.push(seg);
            }
        }
        return Some(out);
    }
    None
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(dir).wrap_err_with(|| format!("Failed to read {}", dir.display()))?
    {
        let path = entry.wrap_err("Failed to read directory entry")?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn segment_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(OsStr::to_str)
        .map(str::to_string)
        .ok_or_else(|| eyre!("Unrepresentable file name: {}", path.display()))
}

fn insert_conversation_path(
    found: &mut HashMap<String, PreviousConversation>,
    id: String,
    fs_name: String,
    path: PathBuf,
) -> Result<()> {
    match found.entry(id) {
        Entry::Occupied(entry) => {
            bail!(
                "Found two previously exported conversations with the same ID: {} and {}",
                entry.get().fs_name,
                fs_name
            );
        }
        Entry::Vacant(entry) => {
            entry.insert(PreviousConversation {
                fs_name,
                conversation_path: Some(path),
                sender_paths: Vec::new(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rightmost_segment_wins() {
        let path = Path::new("/out/Anna/thumbnails/Anna");
        assert_eq!(
            replace_rightmost_segment(path, "Anna", "Bea"),
            Some(PathBuf::from("/out/Anna/thumbnails/Bea"))
        );
    }

    #[test]
    fn substring_of_ancestor_does_not_match() {
        // "Anna" occurs inside "Annabelle" but only whole segments count.
        let path = Path::new("/out/Annabelle/Anna");
        assert_eq!(
            replace_rightmost_segment(path, "Anna", "Bea"),
            Some(PathBuf::from("/out/Annabelle/Bea"))
        );
        let path = Path::new("/out/Annabelle/photos");
        assert_eq!(replace_rightmost_segment(path, "Anna", "Bea"), None);
    }

    #[test]
    fn index_files_keep_their_extension() {
        let path = Path::new("/out/Anna.html");
        assert_eq!(
            replace_rightmost_segment(path, "Anna", "Bea"),
            Some(PathBuf::from("/out/Bea.html"))
        );
    }

    #[test]
    fn missing_segment_is_none() {
        assert_eq!(
            replace_rightmost_segment(Path::new("/out/Carl"), "Anna", "Bea"),
            None
        );
    }

    #[test]
    fn marker_found_in_document_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        fs::write(
            &path,
            "<!DOCTYPE html>\n<html data-conversation-id=\"abc-123\">\n<head></head></html>\n",
        )
        .unwrap();
        assert_eq!(
            read_conversation_id(&path).unwrap(),
            Some("abc-123".to_string())
        );
    }

    #[test]
    fn marker_absent_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        fs::write(&path, "<!DOCTYPE html>\n<html>\n</html>\n").unwrap();
        assert_eq!(read_conversation_id(&path).unwrap(), None);
    }

    #[test]
    fn marker_beyond_scan_window_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.html");
        let mut doc = String::from("<!DOCTYPE html>\n<html>\n");
        doc.push_str(&"<p>padding</p>\n".repeat(400));
        doc.push_str("<div data-conversation-id=\"too-late\"></div></html>\n");
        fs::write(&path, doc).unwrap();
        assert_eq!(read_conversation_id(&path).unwrap(), None);
    }
}
