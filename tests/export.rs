//! Attachment export behavior over real (temporary) directory trees:
//! naming, deduplication, idempotent re-runs, skip semantics.

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Local, TimeZone};

use signal_media_export::attachments::{Attachment, AttachmentExporter, ExportStats};
use signal_media_export::dedup::DedupIndex;
use signal_media_export::store::{Contact, ContactRegistry};

struct Fixture {
    _tmp: tempfile::TempDir,
    signal_dir: PathBuf,
    output_dir: PathBuf,
    contacts: ContactRegistry,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let signal_dir = tmp.path().join("Signal");
    fs::create_dir_all(signal_dir.join("attachments.noindex")).unwrap();
    let output_dir = tmp.path().join("out");
    fs::create_dir_all(&output_dir).unwrap();

    let mut contacts = ContactRegistry::new();
    contacts.insert(
        "+491701234567".to_string(),
        Contact {
            id: Some("conv-alice".to_string()),
            display_name: "Alice".to_string(),
            fs_name: "Alice".to_string(),
        },
    );

    Fixture {
        _tmp: tmp,
        signal_dir,
        output_dir,
        contacts,
    }
}

impl Fixture {
    fn stage(&self, rel: &str, bytes: &[u8]) -> Attachment {
        let path = self.signal_dir.join("attachments.noindex").join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, bytes).unwrap();
        Attachment {
            path: Some(rel.to_string()),
            content_type: Some("image/png".to_string()),
            ..Attachment::default()
        }
    }

    fn exporter(&self) -> AttachmentExporter<'_> {
        AttachmentExporter::new(&self.output_dir, &self.signal_dir, &self.contacts)
    }
}

fn sent(minute: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(2023, 5, 17, 12, minute, 0).unwrap()
}

#[test]
fn export_copies_file_and_writes_marker() {
    let fx = fixture();
    let att = fx.stage("ab/cdef", b"jpeg bytes");
    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();

    let rel = fx
        .exporter()
        .export(&att, "+491701234567", sent(30), 0, 1, ".", &mut dedup, &mut stats)
        .unwrap()
        .expect("attachment should be exported");

    assert_eq!(rel, PathBuf::from("Alice/signal-2023-05-17-123000.png"));
    let dst = fx.output_dir.join(&rel);
    assert_eq!(fs::read(&dst).unwrap(), b"jpeg bytes");
    assert_eq!(
        fs::read_to_string(fx.output_dir.join("Alice/conversationId.txt")).unwrap(),
        "conv-alice"
    );
    assert_eq!(stats.attachments, 1);
    assert_eq!(stats.saved_attachments, 1);
    assert_eq!(stats.saved_attachments_size, b"jpeg bytes".len() as u64);

    // Destination carries the message's sent time.
    let modified = fs::metadata(&dst).unwrap().modified().unwrap();
    assert_eq!(modified, SystemTime::from(sent(30)));
}

#[test]
fn rerun_with_fresh_index_copies_nothing() {
    let fx = fixture();
    let att = fx.stage("ab/cdef", b"jpeg bytes");

    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();
    let first = fx
        .exporter()
        .export(&att, "+491701234567", sent(30), 0, 1, ".", &mut dedup, &mut stats)
        .unwrap();

    // New process: empty index, fresh stats.
    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();
    let second = fx
        .exporter()
        .export(&att, "+491701234567", sent(30), 0, 1, ".", &mut dedup, &mut stats)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(stats.attachments, 1);
    assert_eq!(stats.saved_attachments, 0);
    assert_eq!(stats.saved_attachments_size, 0);
}

#[test]
fn identical_bytes_copied_once() {
    let fx = fixture();
    let first = fx.stage("aa/first", b"the very same image");
    let second = fx.stage("bb/second", b"the very same image");
    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();
    let exporter = fx.exporter();

    let first_rel = exporter
        .export(&first, "+491701234567", sent(30), 0, 1, ".", &mut dedup, &mut stats)
        .unwrap();
    assert!(first_rel.is_some());

    // Different timestamp, so a different destination name: the copy is
    // skipped and the request resolves to no path.
    let second_rel = exporter
        .export(&second, "+491701234567", sent(31), 0, 1, ".", &mut dedup, &mut stats)
        .unwrap();
    assert!(second_rel.is_none());
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.saved_attachments, 1);

    let media_files: Vec<_> = fs::read_dir(fx.output_dir.join("Alice"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "conversationId.txt")
        .collect();
    assert_eq!(media_files.len(), 1);
}

#[test]
fn shared_fingerprint_prefix_still_copies_both() {
    let fx = fixture();
    // Identical first KiB, divergent tails: same cheap fingerprint, but the
    // exact-match gate must keep them apart.
    let mut bytes_a = vec![0x42u8; 2048];
    let mut bytes_b = bytes_a.clone();
    bytes_a[1500] = 1;
    bytes_b[1500] = 2;
    let a = fx.stage("aa/first", &bytes_a);
    let b = fx.stage("bb/second", &bytes_b);

    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();
    let exporter = fx.exporter();

    let rel_a = exporter
        .export(&a, "+491701234567", sent(30), 0, 1, ".", &mut dedup, &mut stats)
        .unwrap();
    let rel_b = exporter
        .export(&b, "+491701234567", sent(31), 0, 1, ".", &mut dedup, &mut stats)
        .unwrap();

    let rel_a = rel_a.unwrap();
    let rel_b = rel_b.unwrap();
    assert_ne!(rel_a, rel_b);
    assert_eq!(stats.saved_attachments, 2);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(fs::read(fx.output_dir.join(rel_a)).unwrap(), bytes_a);
    assert_eq!(fs::read(fx.output_dir.join(rel_b)).unwrap(), bytes_b);
}

#[test]
fn undownloaded_and_missing_attachments_skip_quietly() {
    let fx = fixture();
    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();
    let exporter = fx.exporter();

    let not_downloaded = Attachment {
        content_type: Some("image/png".to_string()),
        ..Attachment::default()
    };
    let pending = Attachment {
        path: Some("ab/cdef".to_string()),
        pending: true,
        ..Attachment::default()
    };
    let dangling = Attachment {
        path: Some("zz/not-there".to_string()),
        content_type: Some("image/png".to_string()),
        ..Attachment::default()
    };

    for att in [&not_downloaded, &pending, &dangling] {
        let rel = exporter
            .export(att, "+491701234567", sent(30), 0, 1, ".", &mut dedup, &mut stats)
            .unwrap();
        assert!(rel.is_none());
    }
    // None of these count as seen; nothing was written.
    assert_eq!(stats.attachments, 0);
    assert!(!fx.output_dir.join("Alice").exists());
}

#[test]
fn purpose_subdir_nests_under_sender() {
    let fx = fixture();
    let thumb = fx.stage("th/umb", b"thumbnail bytes");
    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();

    let rel = fx
        .exporter()
        .export(
            &thumb,
            "+491701234567",
            sent(30),
            0,
            2,
            "thumbnails",
            &mut dedup,
            &mut stats,
        )
        .unwrap()
        .unwrap();

    assert_eq!(
        rel,
        PathBuf::from("Alice/thumbnails/signal-2023-05-17-123000-0.png")
    );
    assert!(fx.output_dir.join(rel).is_file());
}

#[test]
fn unknown_sender_exports_under_sanitized_number() {
    let fx = fixture();
    let att = fx.stage("ab/cdef", b"bytes");
    let mut dedup = DedupIndex::new();
    let mut stats = ExportStats::default();

    let rel = fx
        .exporter()
        .export(&att, "+49999", sent(30), 0, 1, ".", &mut dedup, &mut stats)
        .unwrap()
        .unwrap();

    assert_eq!(rel, PathBuf::from("+49999/signal-2023-05-17-123000.png"));
    // No conversation id known for an unmapped number, so no marker either.
    assert!(!fx.output_dir.join("+49999/conversationId.txt").exists());
}
