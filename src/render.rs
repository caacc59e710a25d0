//! Streaming HTML rendering of one conversation.
//!
//! The `data-conversation-id` attribute on the document root is load-bearing:
//! it is the marker later runs scan for to survive display-name changes.

use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use eyre::{Context, Result};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::attachments::{AttachmentExporter, ExportStats};
use crate::dedup::DedupIndex;
use crate::store::{ContactRegistry, ConversationRef, MessageRecord, Quote, Reaction};

/// Fuzzy URL matcher: a known scheme up to whitespace, trimmed so the last
/// character cannot be trailing punctuation. A match preceded by a word
/// character is rejected separately (the regex crate has no lookbehind).
static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:file|ftp|https?)://\S*[\w#$%&*+/=@\\^_`|~-]").unwrap()
});

/// Written to the output root when no `style.css` exists yet.
pub const DEFAULT_STYLESHEET: &str = "\
body { font-family: sans-serif; max-width: 46rem; margin: 0 auto; padding: 1rem; }
.message { margin: 0.6rem 0; padding: 0.5rem 0.8rem; border-radius: 0.6rem; }
.message.incoming { background: #f0f0f0; margin-right: 4rem; }
.message.outgoing { background: #d4e7ff; margin-left: 4rem; }
.author { font-weight: bold; font-size: 0.85rem; margin-bottom: 0.2rem; }
.quote { border-left: 3px solid #999; padding-left: 0.6rem; margin: 0.3rem 0; color: #555; }
.contacts { background: #fafafa; font-size: 0.8rem; overflow-x: auto; }
.footer { color: #666; font-size: 0.75rem; margin-top: 0.3rem; }
.reactions { margin-top: 0.3rem; }
.reaction { background: #fff; border: 1px solid #ccc; border-radius: 0.8rem; padding: 0 0.4rem; margin-right: 0.3rem; font-size: 0.85rem; }
img, video { max-width: 100%; border-radius: 0.3rem; }
";

#[allow(clippy::too_many_arguments)]
pub fn render_conversation<W: Write>(
    w: &mut W,
    conversation: &ConversationRef,
    messages: &[MessageRecord],
    stylesheet_href: &str,
    exporter: &AttachmentExporter<'_>,
    contacts: &ContactRegistry,
    dedup: &mut DedupIndex,
    stats: &mut ExportStats,
    max_attachments: u64,
) -> Result<()> {
    writeln!(w, "<!DOCTYPE html>")?;
    writeln!(
        w,
        "<html data-conversation-id=\"{}\">",
        escape(&conversation.id)
    )?;
    writeln!(w, "<head>")?;
    writeln!(w, "<meta charset=\"utf-8\"/>")?;
    writeln!(w, "<title>{}</title>", escape(&conversation.display_name))?;
    writeln!(w, "<base target=\"_blank\"/>")?;
    writeln!(
        w,
        "<link rel=\"stylesheet\" href=\"{}\"/>",
        escape(stylesheet_href)
    )?;
    writeln!(w, "</head>")?;
    writeln!(w, "<body>")?;

    for (i, msg) in messages.iter().enumerate() {
        render_message(w, msg, exporter, contacts, dedup, stats, max_attachments)
            .wrap_err_with(|| {
                format!("Failed to render a message in {}", conversation.display_name)
            })?;
        if i > 0 && i % 100 == 0 {
            info!(
                "{:04}/{:04} messages | {:.1} % processed",
                i,
                messages.len(),
                i as f64 / messages.len() as f64 * 100.0
            );
        }
    }

    writeln!(w, "</body>")?;
    writeln!(w, "</html>")?;
    Ok(())
}

fn render_message<W: Write>(
    w: &mut W,
    msg: &MessageRecord,
    exporter: &AttachmentExporter<'_>,
    contacts: &ContactRegistry,
    dedup: &mut DedupIndex,
    stats: &mut ExportStats,
    max_attachments: u64,
) -> Result<()> {
    writeln!(w, "<div class=\"message {}\">", escape(&msg.kind))?;

    if msg.kind == "incoming"
        && let Some(source) = msg.source.as_deref()
    {
        let author = contacts.resolve(source).display_name;
        writeln!(w, "<div class=\"author\">{}</div>", escape(&author))?;
    }

    if let Some(quote) = &msg.quote {
        render_quote(w, quote, contacts)?;
    }

    let sent_at = msg
        .sent_at
        .and_then(DateTime::from_timestamp_millis)
        .map(|dt| dt.with_timezone(&Local));

    if !msg.attachments.is_empty() {
        match (msg.source.as_deref(), sent_at) {
            (Some(source), Some(sent_at)) => {
                if max_attachments == 0 || (stats.attachments as u64) < max_attachments {
                    render_attachments(w, msg, source, sent_at, exporter, dedup, stats)?;
                }
            }
            _ => warn!("Skipping attachments of a message with no sender or timestamp"),
        }
    }

    if !msg.contact.is_empty() {
        let cards = serde_json::to_string_pretty(&msg.contact)
            .wrap_err("Failed to serialize shared contact cards")?;
        writeln!(
            w,
            "<pre class=\"contacts\"><code>{}</code></pre>",
            escape(&cards)
        )?;
    }

    if let Some(body) = msg.body.as_deref()
        && !body.is_empty()
    {
        render_text(w, body)?;
    }

    if let Some(sent_at) = sent_at {
        writeln!(
            w,
            "<div class=\"footer\"><time>{}</time></div>",
            sent_at.format("%Y-%m-%d %H:%M:%S")
        )?;
    }

    if !msg.reactions.is_empty() {
        render_reactions(w, &msg.reactions)?;
    }

    writeln!(w, "</div>")?;
    Ok(())
}

fn render_quote<W: Write>(w: &mut W, quote: &Quote, contacts: &ContactRegistry) -> Result<()> {
    writeln!(w, "<div class=\"quote\">")?;
    if let Some(author) = quote.author.as_deref() {
        let author = contacts.resolve(author).display_name;
        writeln!(w, "<div class=\"author\">{}</div>", escape(&author))?;
    }
    if let Some(text) = quote.text.as_deref()
        && !text.is_empty()
    {
        render_text(w, text)?;
    }
    writeln!(w, "</div>")?;
    Ok(())
}

/// Reactions grouped by emoji in first-seen order; the reactor ids go into
/// the span's title, the count is appended when more than one.
fn render_reactions<W: Write>(w: &mut W, reactions: &[Reaction]) -> Result<()> {
    let mut grouped: Vec<(&str, Vec<&str>)> = Vec::new();
    for reaction in reactions {
        match grouped.iter_mut().find(|(emoji, _)| *emoji == reaction.emoji) {
            Some((_, reactors)) => reactors.push(&reaction.from_id),
            None => grouped.push((&reaction.emoji, vec![&reaction.from_id])),
        }
    }

    writeln!(w, "<div class=\"reactions\">")?;
    for (emoji, reactors) in grouped {
        write!(
            w,
            "<span class=\"reaction\" title=\"{}\">{}",
            escape(&reactors.join(", ")),
            escape(emoji)
        )?;
        if reactors.len() > 1 {
            write!(w, " {}", reactors.len())?;
        }
        writeln!(w, "</span>")?;
    }
    writeln!(w, "</div>")?;
    Ok(())
}

fn render_text<W: Write>(w: &mut W, text: &str) -> Result<()> {
    write!(w, "<div class=\"text\">")?;
    for (i, line) in text.lines().enumerate() {
        if i > 0 {
            write!(w, "<br/>")?;
        }
        render_line(w, line)?;
    }
    writeln!(w, "</div>")?;
    Ok(())
}

/// One line of body text, with recognized URLs turned into links.
fn render_line<W: Write>(w: &mut W, line: &str) -> Result<()> {
    let mut cursor = 0;
    for m in URL_RE.find_iter(line) {
        let mid_word = line[..m.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if mid_word {
            continue;
        }
        write!(w, "{}", escape(&line[cursor..m.start()]))?;
        let url = escape(m.as_str());
        write!(
            w,
            "<a href=\"{url}\" rel=\"external noopener noreferrer\">{url}</a>"
        )?;
        cursor = m.end();
    }
    write!(w, "{}", escape(&line[cursor..]))?;
    Ok(())
}

fn render_attachments<W: Write>(
    w: &mut W,
    msg: &MessageRecord,
    source: &str,
    sent_at: DateTime<Local>,
    exporter: &AttachmentExporter<'_>,
    dedup: &mut DedupIndex,
    stats: &mut ExportStats,
) -> Result<()> {
    let count = msg.attachments.len();
    for (idx, att) in msg.attachments.iter().enumerate() {
        if !att.is_visual_media() {
            debug!(
                "Skipping an attachment (content type {:?} not eligible)",
                att.content_type
            );
            continue;
        }

        let att_path = exporter.export(att, source, sent_at, idx, count, ".", dedup, stats)?;
        let thumbnail_path = match &att.thumbnail {
            Some(thumbnail) => exporter.export(
                thumbnail, source, sent_at, idx, count, "thumbnails", dedup, stats,
            )?,
            None => None,
        };

        // Not downloaded or deduplicated away; nothing to reference.
        let Some(att_path) = att_path else {
            continue;
        };
        let href = escape(&href_of(&att_path));
        let thumbnail_href = thumbnail_path.as_deref().map(|p| escape(&href_of(p)));

        let content_type = att.content_type.as_deref().unwrap_or_default();
        if content_type.starts_with("audio/") {
            writeln!(w, "<audio controls preload=\"metadata\" src=\"{href}\"></audio>")?;
        } else if content_type.starts_with("image/") {
            let img = thumbnail_href.as_deref().unwrap_or(&href);
            writeln!(
                w,
                "<a href=\"{href}\" rel=\"noopener noreferrer\"><img src=\"{img}\"/></a>"
            )?;
        } else if content_type.starts_with("video/") {
            if count > 1 {
                write!(
                    w,
                    "<video controls preload=\"none\" height=\"150\" width=\"150\""
                )?;
                if let Some(poster) = thumbnail_href.as_deref() {
                    write!(w, " poster=\"{poster}\"")?;
                }
                writeln!(w, " src=\"{href}\"></video>")?;
            } else {
                let poster = match &att.screenshot {
                    // A video may not have a screenshot.
                    Some(screenshot) => exporter
                        .export(
                            screenshot,
                            source,
                            sent_at,
                            idx,
                            count,
                            "screenshots",
                            dedup,
                            stats,
                        )?
                        .map(|p| escape(&href_of(&p))),
                    None => None,
                };
                write!(w, "<video controls preload=\"none\"")?;
                if let Some(poster) = poster {
                    write!(w, " poster=\"{poster}\"")?;
                }
                writeln!(w, " src=\"{href}\"></video>")?;
            }
        }
    }
    Ok(())
}

/// Relative path as a URL: forward slashes regardless of platform.
fn href_of(path: &Path) -> String {
    path.iter()
        .map(|seg| seg.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_covers_markup_characters() {
        assert_eq!(escape("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
        assert_eq!(escape("plain"), "plain");
    }

    fn linkified(line: &str) -> String {
        let mut buf = Vec::new();
        render_line(&mut buf, line).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn urls_become_links() {
        assert_eq!(
            linkified("see https://example.org/a_b ok"),
            "see <a href=\"https://example.org/a_b\" rel=\"external noopener noreferrer\">https://example.org/a_b</a> ok"
        );
    }

    #[test]
    fn trailing_punctuation_stays_outside_the_link() {
        assert_eq!(
            linkified("read http://example.org/page."),
            "read <a href=\"http://example.org/page\" rel=\"external noopener noreferrer\">http://example.org/page</a>."
        );
        assert_eq!(
            linkified("(https://example.org)"),
            "(<a href=\"https://example.org\" rel=\"external noopener noreferrer\">https://example.org</a>)"
        );
    }

    #[test]
    fn scheme_inside_a_word_is_not_a_link() {
        assert_eq!(linkified("foohttp://nope"), "foohttp://nope");
        assert_eq!(linkified("no scheme example.org here"), "no scheme example.org here");
    }

    #[test]
    fn hrefs_use_forward_slashes() {
        let path: std::path::PathBuf = ["Alice", "thumbnails", "signal-x.jpg"].iter().collect();
        assert_eq!(href_of(&path), "Alice/thumbnails/signal-x.jpg");
    }
}
