//! Raw RFC 5322 parsing into [`EmailRecord`]s.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use crate::pipeline::types::{EmailRecord, key_safe};

/// Parse a raw `.eml` message. Returns `None` if the bytes are not a message
/// or carry no sender.
pub fn parse_eml(raw: &[u8]) -> Option<EmailRecord> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed.from().and_then(|addr| addr.first())?;
    let from = sender.address()?.to_string();
    let from_name = sender.name().map(|s| s.to_string());

    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    // Thread root is the first References entry, else In-Reply-To.
    let conversation_id = first_message_id(parsed.references())
        .or_else(|| first_message_id(parsed.in_reply_to()))
        .map(|r| conversation_from_ref(&r));

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(EmailRecord {
        id,
        conversation_id,
        from,
        from_name,
        to: extract_addresses(parsed.to()).join(", "),
        subject: parsed.subject().unwrap_or("").to_string(),
        body: extract_text(&parsed),
        received_at,
    })
}

fn first_message_id(value: &mail_parser::HeaderValue) -> Option<String> {
    value.as_text().map(|s| s.to_string()).or_else(|| {
        value
            .as_text_list()
            .and_then(|ids| ids.first())
            .map(|s| s.to_string())
    })
}

/// Turn a thread root Message-ID into a conversation key.
fn conversation_from_ref(message_id: &str) -> String {
    format!("thr-{}", key_safe(message_id, 120))
}

/// Extract email addresses from an optional mail_parser Address field.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

/// Readable text of a parsed message: plain part, else stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.trim().to_string();
        }
    }
    String::new()
}

/// Strip HTML tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
