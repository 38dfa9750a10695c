//! MIME content extraction — raw POP3 payload to a normalized record.
//!
//! Header decoding (encoded-words, charset fallbacks) is delegated to
//! `mail-parser`, which degrades undecodable bytes to replacement
//! characters instead of failing. Body selection prefers an HTML part
//! converted to plain text; images are captured from every `image/*`
//! part regardless of disposition.

use chrono::{DateTime, Utc};
use mail_parser::{Address, Message, MessageParser, MimeHeaders};

use crate::error::ExtractError;

/// One extracted image, inline or attached.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
    pub size: usize,
}

/// Normalized message content, consumed within the same polling cycle.
#[derive(Debug, Clone)]
pub struct EmailContent {
    /// Session-local POP3 message number, for deletion marking only.
    pub source_ref: u32,
    /// Cross-session identifier: the Message-ID header when present,
    /// otherwise derived from the message number and receipt time.
    pub dedup_key: String,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    pub images: Vec<ImageAttachment>,
    pub received_at: DateTime<Utc>,
}

/// Extract normalized content from a raw message payload.
///
/// Individual undecodable parts are skipped; only a payload that cannot
/// be parsed at all is an error, which the caller logs and drops.
pub fn extract(raw: &[u8], seq: u32) -> Result<EmailContent, ExtractError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(ExtractError::Unparseable)?;

    let subject = parsed.subject().unwrap_or("No Subject").to_string();
    let sender = format_address(parsed.from()).unwrap_or_else(|| "Unknown Sender".into());
    let recipient = format_address(parsed.to()).unwrap_or_else(|| "Unknown Recipient".into());

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    // Message-ID survives across sessions; the sequence-number scheme is
    // the last resort and collides if the same message is re-listed
    // under a different number.
    let dedup_key = parsed
        .message_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{seq}_{}", received_at.timestamp()));

    let body = select_body(&parsed);
    let images = extract_images(&parsed);

    Ok(EmailContent {
        source_ref: seq,
        dedup_key,
        subject,
        sender,
        recipient,
        body,
        images,
        received_at,
    })
}

/// Render the first address of a header as `Name <addr>`.
fn format_address(addr: Option<&Address<'_>>) -> Option<String> {
    let first = addr?.first()?;
    match (first.name(), first.address()) {
        (Some(name), Some(email)) => Some(format!("{name} <{email}>")),
        (None, Some(email)) => Some(email.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => None,
    }
}

/// Pick the message body: the first HTML part converted to plain text,
/// falling back to the first plain-text part when the conversion yields
/// nothing.
fn select_body(msg: &Message<'_>) -> String {
    if let Some(html) = first_html_part(msg) {
        let converted = html_to_text(html);
        if !converted.is_empty() {
            return converted;
        }
    }
    msg.body_text(0)
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

fn first_html_part<'x>(msg: &'x Message<'_>) -> Option<&'x str> {
    let id = *msg.html_body.first()? as usize;
    msg.parts.get(id)?.text_contents()
}

/// Capture every `image/*` part in document order, inline or attached.
/// Non-image attachments are never surfaced.
fn extract_images(msg: &Message<'_>) -> Vec<ImageAttachment> {
    let mut images = Vec::new();
    for part in &msg.parts {
        let Some(ct) = MimeHeaders::content_type(part) else {
            continue;
        };
        if !ct.ctype().eq_ignore_ascii_case("image") {
            continue;
        }

        let data = part.contents();
        if data.is_empty() {
            continue;
        }

        let content_type = match ct.subtype() {
            Some(subtype) => format!("image/{}", subtype.to_ascii_lowercase()),
            None => "image".to_string(),
        };
        let filename = MimeHeaders::attachment_name(part)
            .map(str::to_string)
            .unwrap_or_else(|| synthesized_name(&content_type, images.len()));

        images.push(ImageAttachment {
            filename,
            content_type,
            size: data.len(),
            data: data.to_vec(),
        });
    }
    images
}

/// Name for an image part that carries no filename. The ordinal keeps
/// names unique within a batch extracted in the same millisecond.
fn synthesized_name(content_type: &str, ordinal: usize) -> String {
    let ext = content_type.rsplit('/').next().filter(|s| !s.is_empty());
    format!(
        "image_{}_{}.{}",
        Utc::now().timestamp_millis(),
        ordinal,
        ext.unwrap_or("bin")
    )
}

// ── HTML to plain text ──────────────────────────────────────────────

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "div", "dd", "dl", "dt", "fieldset",
    "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main",
    "nav", "ol", "p", "pre", "section", "table", "td", "th", "tr", "ul",
];

/// Convert HTML to plain text: each block-level element becomes its own
/// line, script/style contents and comments are dropped, entities are
/// decoded, and blank lines are removed.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::new();
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        decode_entities(&rest[..lt], &mut text);
        let after = &rest[lt + 1..];

        // Comments may contain '>'
        if let Some(comment) = after.strip_prefix("!--") {
            rest = match comment.find("-->") {
                Some(end) => &comment[end + 3..],
                None => "",
            };
            continue;
        }

        let Some(gt) = after.find('>') else {
            // Unterminated tag: drop the remainder
            return normalize_lines(&text);
        };
        let name = tag_name(&after[..gt]);
        rest = &after[gt + 1..];

        if name == "script" || name == "style" {
            rest = match find_close_tag(rest, &name) {
                Some(pos) => &rest[pos..],
                None => "",
            };
        }
        if BLOCK_TAGS.contains(&name.as_str()) {
            text.push('\n');
        }
    }
    decode_entities(rest, &mut text);

    normalize_lines(&text)
}

/// Lowercased element name of a tag body, ignoring `/` and attributes.
fn tag_name(tag: &str) -> String {
    tag.trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Byte offset just past the closing tag `</name>`, case-insensitive.
fn find_close_tag(s: &str, name: &str) -> Option<usize> {
    let close = format!("</{name}");
    let mut from = 0;
    while let Some(pos) = s[from..].find('<') {
        let start = from + pos;
        let matches = s
            .get(start..start + close.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(&close));
        if matches {
            return match s[start..].find('>') {
                Some(gt) => Some(start + gt + 1),
                None => Some(s.len()),
            };
        }
        from = start + 1;
    }
    None
}

/// Append a text run with HTML entities decoded. Unknown entities are
/// kept literally.
fn decode_entities(input: &str, out: &mut String) {
    let mut rest = input;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];

        let decoded = after
            .find(';')
            .filter(|&semi| semi > 0 && semi <= 8)
            .and_then(|semi| lookup_entity(&after[..semi]).map(|ch| (ch, semi)));

        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &after[semi + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
}

fn lookup_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let num = entity.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Trim every line and drop the blank ones, so adjacent blocks are
/// separated by exactly one newline.
fn normalize_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── HTML conversion ─────────────────────────────────────────────

    #[test]
    fn html_blocks_become_lines() {
        assert_eq!(html_to_text("<p>Hello</p><p>World</p>"), "Hello\nWorld");
    }

    #[test]
    fn html_inline_tags_do_not_break_lines() {
        assert_eq!(
            html_to_text("<p><b>Bold</b> and <i>italic</i></p>"),
            "Bold and italic"
        );
    }

    #[test]
    fn html_br_breaks_line() {
        assert_eq!(html_to_text("one<br>two<br/>three"), "one\ntwo\nthree");
    }

    #[test]
    fn html_script_and_style_dropped() {
        assert_eq!(
            html_to_text("<style>p { color: red }</style><p>visible</p><script>alert('x')</script>"),
            "visible"
        );
    }

    #[test]
    fn html_comments_dropped() {
        assert_eq!(html_to_text("a<!-- hidden > still hidden -->b"), "ab");
    }

    #[test]
    fn html_entities_decoded() {
        assert_eq!(html_to_text("Fish &amp; chips &lt;3 &#65;&#x42;"), "Fish & chips <3 AB");
    }

    #[test]
    fn html_unknown_entity_kept() {
        assert_eq!(html_to_text("a &bogus; b"), "a &bogus; b");
    }

    #[test]
    fn html_blank_lines_removed() {
        assert_eq!(
            html_to_text("<div>a</div>\n\n\n<div></div><div>b</div>"),
            "a\nb"
        );
    }

    #[test]
    fn html_unterminated_tag_truncates() {
        assert_eq!(html_to_text("ok<p unterminated"), "ok");
    }

    #[test]
    fn html_table_rows_become_lines() {
        assert_eq!(
            html_to_text("<table><tr><td>a</td></tr><tr><td>b</td></tr></table>"),
            "a\nb"
        );
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(html_to_text("no markup here"), "no markup here");
    }

    // ── Extraction ──────────────────────────────────────────────────

    fn simple_message() -> &'static [u8] {
        b"From: Alice <alice@example.com>\r\n\
          To: bob@example.com\r\n\
          Subject: Hello\r\n\
          Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
          Message-ID: <abc123@example.com>\r\n\
          Content-Type: text/plain\r\n\
          \r\n\
          Hello world\r\n"
    }

    #[test]
    fn extracts_headers_and_body() {
        let content = extract(simple_message(), 1).unwrap();
        assert_eq!(content.subject, "Hello");
        assert_eq!(content.sender, "Alice <alice@example.com>");
        assert_eq!(content.recipient, "bob@example.com");
        assert_eq!(content.body, "Hello world");
        assert_eq!(content.source_ref, 1);
        assert!(content.images.is_empty());
        assert_eq!(content.received_at.timestamp(), 1_751_364_000);
    }

    #[test]
    fn dedup_key_prefers_message_id() {
        let content = extract(simple_message(), 7).unwrap();
        assert_eq!(content.dedup_key, "abc123@example.com");
    }

    #[test]
    fn dedup_key_falls_back_to_seq_and_timestamp() {
        let raw = b"From: a@example.com\r\n\
                    Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
                    \r\n\
                    body\r\n";
        let content = extract(raw, 3).unwrap();
        assert_eq!(content.dedup_key, "3_1751364000");
    }

    #[test]
    fn missing_headers_get_sentinels() {
        let raw = b"Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\r\nbody\r\n";
        let content = extract(raw, 1).unwrap();
        assert_eq!(content.subject, "No Subject");
        assert_eq!(content.sender, "Unknown Sender");
        assert_eq!(content.recipient, "Unknown Recipient");
    }

    #[test]
    fn unparseable_date_falls_back_to_extraction_time() {
        let raw = b"From: a@example.com\r\n\
                    Subject: x\r\n\
                    Date: not a real date\r\n\
                    \r\n\
                    body\r\n";
        let before = Utc::now();
        let content = extract(raw, 1).unwrap();
        assert!(content.received_at >= before - chrono::Duration::seconds(5));
        assert!(content.received_at <= Utc::now() + chrono::Duration::seconds(5));
    }

    #[test]
    fn encoded_word_subject_is_decoded() {
        let raw = b"From: a@example.com\r\n\
                    Subject: =?utf-8?Q?Caf=C3=A9?=\r\n\
                    \r\n\
                    body\r\n";
        let content = extract(raw, 1).unwrap();
        assert_eq!(content.subject, "Caf\u{e9}");
    }

    #[test]
    fn quoted_printable_body_is_decoded() {
        let raw = b"From: a@example.com\r\n\
                    Content-Type: text/plain; charset=utf-8\r\n\
                    Content-Transfer-Encoding: quoted-printable\r\n\
                    \r\n\
                    Caf=C3=A9\r\n";
        let content = extract(raw, 1).unwrap();
        assert_eq!(content.body, "Caf\u{e9}");
    }

    #[test]
    fn html_body_preferred_over_plain_text() {
        let raw = b"From: a@example.com\r\n\
                    Content-Type: multipart/alternative; boundary=\"b\"\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    plain version\r\n\
                    --b\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    <p>Hello</p><p>World</p>\r\n\
                    --b--\r\n";
        let content = extract(raw, 1).unwrap();
        assert_eq!(content.body, "Hello\nWorld");
    }

    #[test]
    fn empty_html_falls_back_to_plain_text() {
        let raw = b"From: a@example.com\r\n\
                    Content-Type: multipart/alternative; boundary=\"b\"\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    plain version\r\n\
                    --b\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    <style>x</style>\r\n\
                    --b--\r\n";
        let content = extract(raw, 1).unwrap();
        assert_eq!(content.body, "plain version");
    }

    #[test]
    fn image_attachment_is_captured() {
        let raw = b"From: a@example.com\r\n\
                    Content-Type: multipart/mixed; boundary=\"b\"\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    see attached\r\n\
                    --b\r\n\
                    Content-Type: image/png; name=\"pic.png\"\r\n\
                    Content-Disposition: attachment; filename=\"pic.png\"\r\n\
                    Content-Transfer-Encoding: base64\r\n\
                    \r\n\
                    iVBORw0KGgo=\r\n\
                    --b--\r\n";
        let content = extract(raw, 1).unwrap();
        assert_eq!(content.body, "see attached");
        assert_eq!(content.images.len(), 1);
        let image = &content.images[0];
        assert_eq!(image.filename, "pic.png");
        assert_eq!(image.content_type, "image/png");
        assert_eq!(image.data, b"\x89PNG\r\n\x1a\n");
        assert_eq!(image.size, image.data.len());
    }

    #[test]
    fn inline_image_without_filename_gets_synthesized_name() {
        let raw = b"From: a@example.com\r\n\
                    Content-Type: multipart/related; boundary=\"b\"\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Type: text/html\r\n\
                    \r\n\
                    <p>pic below</p>\r\n\
                    --b\r\n\
                    Content-Type: image/jpeg\r\n\
                    Content-Disposition: inline\r\n\
                    Content-Transfer-Encoding: base64\r\n\
                    \r\n\
                    /9j/4AA=\r\n\
                    --b--\r\n";
        let content = extract(raw, 1).unwrap();
        assert_eq!(content.images.len(), 1);
        let image = &content.images[0];
        assert!(image.filename.starts_with("image_"));
        assert!(image.filename.ends_with(".jpeg"));
        assert_eq!(image.content_type, "image/jpeg");
    }

    #[test]
    fn non_image_attachments_are_skipped() {
        let raw = b"From: a@example.com\r\n\
                    Content-Type: multipart/mixed; boundary=\"b\"\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Type: text/plain\r\n\
                    \r\n\
                    report attached\r\n\
                    --b\r\n\
                    Content-Type: application/pdf; name=\"report.pdf\"\r\n\
                    Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
                    Content-Transfer-Encoding: base64\r\n\
                    \r\n\
                    JVBERi0=\r\n\
                    --b--\r\n";
        let content = extract(raw, 1).unwrap();
        assert!(content.images.is_empty());
        assert_eq!(content.body, "report attached");
    }

    #[test]
    fn multiple_images_keep_document_order() {
        let raw = b"From: a@example.com\r\n\
                    Content-Type: multipart/mixed; boundary=\"b\"\r\n\
                    \r\n\
                    --b\r\n\
                    Content-Type: image/png; name=\"first.png\"\r\n\
                    Content-Transfer-Encoding: base64\r\n\
                    \r\n\
                    iVBORw0KGgo=\r\n\
                    --b\r\n\
                    Content-Type: image/gif; name=\"second.gif\"\r\n\
                    Content-Transfer-Encoding: base64\r\n\
                    \r\n\
                    R0lGODlh\r\n\
                    --b--\r\n";
        let content = extract(raw, 1).unwrap();
        let names: Vec<&str> = content.images.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, vec!["first.png", "second.gif"]);
    }

    #[test]
    fn empty_payload_is_unparseable() {
        assert!(matches!(extract(b"", 1), Err(ExtractError::Unparseable)));
    }

    #[test]
    fn synthesized_names_are_unique_within_batch() {
        let a = synthesized_name("image/png", 0);
        let b = synthesized_name("image/png", 1);
        assert_ne!(a, b);
        assert!(a.ends_with(".png"));
    }
}
