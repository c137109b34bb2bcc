//! Turns a raw RFC 822 message into the fields the cache stores.

use chrono::{DateTime, NaiveDate, Utc};
use mail_parser::{Message, MessageParser, MessagePart, MimeHeaders, PartType};

pub const NO_SUBJECT: &str = "(no subject)";
pub const NO_CONTENT: &str = "[No content]";

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("message {0} could not be parsed")]
    Unparseable(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub from_address: String,
    pub from_name: String,
    /// Bare mailbox address of the sender, empty when the From header has none.
    pub sender_address: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    /// True when the Date header was missing or unreadable and `received_at` is "now".
    pub date_fallback: bool,
    pub body_text: String,
}

impl NormalizedMessage {
    pub fn sender_domain(&self) -> String {
        sender_domain(&self.sender_address)
    }
}

/// Identifier used when the source has no Message-ID; stable across runs for a given sequence number.
pub fn synthesized_message_id(sequence: u32) -> String {
    format!("<generated-{}@imported>", sequence)
}

pub fn normalize(
    raw: &[u8],
    sequence: u32,
    body_limit: usize,
) -> Result<NormalizedMessage, NormalizeError> {
    let message = MessageParser::default()
        .parse(raw)
        .filter(|m| m.parts.first().is_some_and(|root| !root.headers.is_empty()))
        .ok_or(NormalizeError::Unparseable(sequence))?;

    let message_id = message
        .message_id()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| format!("<{}>", id))
        .unwrap_or_else(|| synthesized_message_id(sequence));

    let subject = message
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_SUBJECT)
        .to_string();

    let Sender {
        rendered: from_address,
        name: from_name,
        address: sender_address,
    } = sender(&message);

    let parsed_date = message.date().and_then(header_date);
    let date_fallback = parsed_date.is_none();
    let received_at = parsed_date.unwrap_or_else(Utc::now);

    let body = plain_text_body(&message, raw);
    let body_text = if body.trim().is_empty() {
        NO_CONTENT.to_string()
    } else {
        truncate_chars(&body, body_limit)
    };

    Ok(NormalizedMessage {
        message_id,
        from_address,
        from_name,
        sender_address,
        subject,
        received_at,
        date_fallback,
        body_text,
    })
}

/// Calendar-checked conversion. mail-parser keeps out-of-range fields, which
/// `to_timestamp` would silently roll over into a different date.
fn header_date(date: &mail_parser::DateTime) -> Option<DateTime<Utc>> {
    if !date.is_valid() {
        return None;
    }
    NaiveDate::from_ymd_opt(
        i32::from(date.year),
        u32::from(date.month),
        u32::from(date.day),
    )?;
    DateTime::<Utc>::from_timestamp(date.to_timestamp(), 0)
}

#[derive(Debug, Default)]
struct Sender {
    rendered: String,
    name: String,
    address: String,
}

/// The first From mailbox, rendered as `Name <addr>` or `addr`.
fn sender(message: &Message<'_>) -> Sender {
    let Some(first) = message.from().and_then(|from| from.first()) else {
        return Sender::default();
    };

    let address = first.address.as_deref().unwrap_or("").trim().to_string();
    let name = first.name.as_deref().map(str::trim).filter(|n| !n.is_empty());

    let (rendered, name) = match name {
        Some(name) if !address.is_empty() => (format!("{} <{}>", name, address), name.to_string()),
        Some(name) => (name.to_string(), name.to_string()),
        None => (address.clone(), address.clone()),
    };
    Sender {
        rendered,
        name,
        address,
    }
}

/// Domain of a From value: the part inside angle brackets when present, after the last `@`,
/// lower-cased. Values without `@` have no domain.
pub fn sender_domain(from: &str) -> String {
    let address = match from.split_once('<') {
        Some((_, rest)) => rest.split('>').next().unwrap_or(rest),
        None => from,
    };

    match address.rsplit_once('@') {
        Some((_, domain)) => domain.trim().to_lowercase(),
        None => String::new(),
    }
}

/// Allow-list of sender domains. An empty list lets everything through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainFilter {
    domains: Vec<String>,
}

impl DomainFilter {
    pub fn parse(spec: Option<&str>) -> Self {
        let domains = spec
            .unwrap_or("")
            .split(',')
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    pub fn is_active(&self) -> bool {
        !self.domains.is_empty()
    }

    pub fn allows(&self, domain: &str) -> bool {
        !self.is_active() || self.domains.iter().any(|d| d == domain)
    }
}

fn plain_text_body(message: &Message<'_>, raw: &[u8]) -> String {
    let Some(root) = message.parts.first() else {
        return String::new();
    };

    match &root.body {
        PartType::Multipart(_) => message
            .parts
            .iter()
            .skip(1)
            .find(|part| is_text_plain(part))
            .map(|part| part_text(part, raw))
            .unwrap_or_default(),
        _ => part_text(root, raw),
    }
}

fn is_text_plain(part: &MessagePart<'_>) -> bool {
    match part.content_type() {
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("plain"))
        }
        // parts without Content-Type default to text/plain
        None => matches!(part.body, PartType::Text(_)),
    }
}

/// Decoded payload of a part; on a decoding problem, the raw bytes of the part.
fn part_text(part: &MessagePart<'_>, raw: &[u8]) -> String {
    if part.is_encoding_problem {
        return raw_part(part, raw);
    }

    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.to_string(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        PartType::Message(_) | PartType::Multipart(_) => raw_part(part, raw),
    }
}

fn raw_part(part: &MessagePart<'_>, raw: &[u8]) -> String {
    raw.get(part.offset_body..part.offset_end)
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default()
}

pub fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SIMPLE: &str = "From: Alice Example <Alice@Example.COM>\r\n\
        To: bob@example.org\r\n\
        Subject: Quarterly numbers\r\n\
        Date: Tue, 14 May 2024 09:30:00 +0000\r\n\
        Message-ID: <abc123@example.com>\r\n\
        \r\n\
        Hi Bob,\r\nnumbers attached.\r\n";

    #[test]
    fn extracts_headers_and_body() {
        let msg = normalize(SIMPLE.as_bytes(), 7, 10_000).unwrap();
        assert_eq!(msg.message_id, "<abc123@example.com>");
        assert_eq!(msg.subject, "Quarterly numbers");
        assert_eq!(msg.from_address, "Alice Example <Alice@Example.COM>");
        assert_eq!(msg.from_name, "Alice Example");
        assert_eq!(msg.sender_domain(), "example.com");
        assert_eq!(
            msg.received_at,
            Utc.with_ymd_and_hms(2024, 5, 14, 9, 30, 0).unwrap()
        );
        assert!(!msg.date_fallback);
        assert!(msg.body_text.starts_with("Hi Bob,"));
    }

    #[test]
    fn missing_message_id_is_synthesized_from_sequence() {
        let raw = "From: a@example.com\r\nSubject: x\r\n\r\nbody\r\n";
        let first = normalize(raw.as_bytes(), 12, 100).unwrap();
        let again = normalize(raw.as_bytes(), 12, 100).unwrap();
        assert_eq!(first.message_id, "<generated-12@imported>");
        assert_eq!(first.message_id, again.message_id);
    }

    #[test]
    fn bad_date_falls_back_to_now() {
        let raw = "From: a@example.com\r\nDate: sometime soon\r\nSubject: x\r\n\r\nbody\r\n";
        let before = Utc::now();
        let msg = normalize(raw.as_bytes(), 1, 100).unwrap();
        assert!(msg.date_fallback);
        assert!(msg.received_at >= before);
        assert!(msg.received_at <= Utc::now());
    }

    #[test]
    fn missing_subject_and_body_get_placeholders() {
        let raw = "From: a@example.com\r\nMessage-ID: <e@x>\r\n\r\n\r\n";
        let msg = normalize(raw.as_bytes(), 1, 100).unwrap();
        assert_eq!(msg.subject, NO_SUBJECT);
        assert_eq!(msg.body_text, NO_CONTENT);
    }

    #[test]
    fn multipart_prefers_first_text_plain_part() {
        let raw = "From: a@example.com\r\n\
            Subject: mixed\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
            \r\n\
            --b1\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <p>html version</p>\r\n\
            --b1\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            plain version\r\n\
            --b1--\r\n";
        let msg = normalize(raw.as_bytes(), 1, 100).unwrap();
        assert_eq!(msg.body_text.trim(), "plain version");
    }

    #[test]
    fn body_is_truncated_by_characters() {
        let body = "é".repeat(50);
        let raw = format!(
            "From: a@example.com\r\nSubject: long\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            body
        );
        let msg = normalize(raw.as_bytes(), 1, 10).unwrap();
        assert_eq!(msg.body_text, "é".repeat(10));
    }

    #[test]
    fn sender_domain_handles_display_names_and_bare_addresses() {
        assert_eq!(sender_domain("Alice <alice@Example.com>"), "example.com");
        assert_eq!(sender_domain("bob@other.com"), "other.com");
        assert_eq!(sender_domain("\"Team\" <ops@mail.corp.io>"), "mail.corp.io");
        assert_eq!(sender_domain("no address here"), "");
        assert_eq!(sender_domain(""), "");
    }

    #[test]
    fn domain_filter_parsing() {
        let filter = DomainFilter::parse(Some(" Example.com, company.com ,,"));
        assert!(filter.is_active());
        assert!(filter.allows("example.com"));
        assert!(filter.allows("company.com"));
        assert!(!filter.allows("other.com"));
        assert!(!filter.allows(""));

        for empty in [None, Some(""), Some(" , ")] {
            let filter = DomainFilter::parse(empty);
            assert!(!filter.is_active());
            assert!(filter.allows("anything.org"));
        }
    }

    #[test]
    fn out_of_range_dates_fall_back_to_now() {
        for date in [
            "Tue, 45 May 2024 10:00:00 +0000",
            "Wed, 01 May 2024 25:61:00 +0000",
            "Fri, 30 Feb 2024 10:00:00 +0000",
        ] {
            let raw = format!(
                "From: a@example.com\r\nDate: {}\r\nSubject: x\r\n\r\nbody\r\n",
                date
            );
            let before = Utc::now();
            let msg = normalize(raw.as_bytes(), 1, 100).unwrap();
            assert!(msg.date_fallback, "{} should not parse", date);
            assert!(msg.received_at >= before);
        }
    }

    #[test]
    fn domain_comes_from_the_address_not_the_display_name() {
        let raw = "From: \"<x@allowed.com>\" <bad@evil.com>\r\nSubject: x\r\n\r\nbody\r\n";
        let msg = normalize(raw.as_bytes(), 1, 100).unwrap();
        assert_eq!(msg.sender_address, "bad@evil.com");
        assert_eq!(msg.sender_domain(), "evil.com");
        assert!(!DomainFilter::parse(Some("allowed.com")).allows(&msg.sender_domain()));
    }

    #[test]
    fn empty_input_is_unparseable() {
        assert!(matches!(
            normalize(b"", 4, 100),
            Err(NormalizeError::Unparseable(4))
        ));
    }

    #[test]
    fn truncate_is_a_noop_for_short_text() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("exactly", 7), "exactly");
        assert_eq!(truncate_chars("abcdef", 3), "abc");
    }
}
