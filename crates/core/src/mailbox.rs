//! Mailbox (mbox) extraction: one document per message, plain-text parts only.

use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use crate::extractor::{file_name, sha256_hex};
use crate::models::{DocType, ExtractedDocument};
use base64::{engine::general_purpose::STANDARD, Engine};
use regex::Regex;
use std::path::Path;
use tracing::{debug, warn};

pub const MAIL_CATEGORY: &str = "mail";
const NO_SUBJECT: &str = "(no subject)";

#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub subject: Option<String>,
    pub body: String,
}

struct Part<'a> {
    headers: Vec<(String, String)>,
    body: &'a str,
}

impl Part<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn charset(&self) -> Option<String> {
        let value = self.header("content-type")?;
        let pattern = Regex::new(r#"(?i)charset="?([^";\s]+)"?"#).ok()?;
        pattern
            .captures(value)
            .and_then(|capture| capture.get(1))
            .map(|charset| charset.as_str().to_string())
    }

    fn content_type(&self) -> String {
        self.header("content-type")
            .unwrap_or("text/plain")
            .to_ascii_lowercase()
    }
}

pub fn extract_mailbox(path: &Path) -> Result<Vec<ExtractedDocument>, IngestError> {
    let name = file_name(path)?;
    let bytes = std::fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);

    let mut documents = Vec::new();
    for (index, raw_message) in split_messages(&content).into_iter().enumerate() {
        let message = match parse_message(raw_message) {
            Ok(message) => message,
            Err(error) => {
                warn!(mailbox = %name, message_index = index, %error, "skipping undecodable message");
                continue;
            }
        };
        let body = normalize_whitespace(&message.body);
        if body.is_empty() {
            debug!(mailbox = %name, "skipping message without text body");
            continue;
        }

        documents.push(ExtractedDocument {
            doc_type: DocType::Mbox,
            title: message.subject.unwrap_or_else(|| NO_SUBJECT.to_string()),
            source: name.clone(),
            raw_text: body,
            category: Some(MAIL_CATEGORY.to_string()),
            checksum: sha256_hex(raw_message.as_bytes()),
        });
    }

    if documents.is_empty() {
        return Err(IngestError::MailboxParse(format!(
            "no readable messages in {}",
            path.display()
        )));
    }

    Ok(documents)
}

/// Splits on `From ` separator lines; text before the first separator is ignored.
pub fn split_messages(content: &str) -> Vec<&str> {
    let mut messages = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in content.split_inclusive('\n') {
        if line.starts_with("From ") {
            if let Some(begin) = start {
                messages.push(&content[begin..offset]);
            }
            start = Some(offset + line.len());
        }
        offset += line.len();
    }
    if let Some(begin) = start {
        messages.push(&content[begin..]);
    }

    messages
        .into_iter()
        .filter(|message| !message.trim().is_empty())
        .collect()
}

pub fn parse_message(raw: &str) -> Result<MailMessage, IngestError> {
    let part = split_part(raw);
    let subject = match part.header("subject") {
        Some(value) => {
            let decoded = normalize_whitespace(&decode_encoded_words(value)?);
            (!decoded.is_empty()).then_some(decoded)
        }
        None => None,
    };

    let body = plain_text(&part, 0)?
        .lines()
        .map(|line| line.strip_prefix('>').filter(|rest| rest.starts_with("From ")).unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(MailMessage { subject, body })
}

fn split_part(raw: &str) -> Part<'_> {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut offset = 0;

    for line in raw.split_inclusive('\n') {
        offset += line.len();
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Part {
                headers,
                body: &raw[offset..],
            };
        }
        if trimmed.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(trimmed.trim());
            }
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Part {
        headers,
        body: "",
    }
}

fn plain_text(part: &Part<'_>, depth: usize) -> Result<String, IngestError> {
    let content_type = part.content_type();

    if content_type.starts_with("multipart/") {
        let Some(boundary) = boundary(&content_type, part.header("content-type"))? else {
            return Ok(String::new());
        };
        if depth > 4 {
            return Ok(String::new());
        }
        let delimiter = format!("--{boundary}");
        let mut texts = Vec::new();
        for section in part.body.split(delimiter.as_str()).skip(1) {
            if section.starts_with("--") {
                break;
            }
            let sub_part = split_part(section.trim_start_matches(['\r', '\n']));
            let text = plain_text(&sub_part, depth + 1)?;
            if !text.trim().is_empty() {
                texts.push(text);
            }
        }
        return Ok(texts.join("\n"));
    }

    if !content_type.starts_with("text/plain") {
        return Ok(String::new());
    }

    let encoding = part
        .header("content-transfer-encoding")
        .unwrap_or("7bit")
        .to_ascii_lowercase();
    match encoding.as_str() {
        "base64" => {
            let compact: String = part.body.split_whitespace().collect();
            let bytes = STANDARD
                .decode(compact.as_bytes())
                .map_err(|error| IngestError::MailboxParse(error.to_string()))?;
            Ok(decode_charset(&bytes, part.charset().as_deref()))
        }
        "quoted-printable" => Ok(decode_charset(
            &decode_quoted_printable(part.body, false),
            part.charset().as_deref(),
        )),
        _ => Ok(part.body.to_string()),
    }
}

fn boundary(lowered: &str, original: Option<&str>) -> Result<Option<String>, IngestError> {
    let pattern = Regex::new(r#"(?i)boundary="?([^";]+)"?"#)?;
    let source = original.unwrap_or(lowered);
    Ok(pattern
        .captures(source)
        .and_then(|capture| capture.get(1))
        .map(|value| value.as_str().trim().to_string()))
}

/// Decodes RFC 2047 encoded words such as `=?UTF-8?B?...?=` in header values.
pub fn decode_encoded_words(value: &str) -> Result<String, IngestError> {
    let pattern = Regex::new(r"=\?([^?]+)\?([BbQq])\?([^?]*)\?=")?;
    let mut decoded = String::new();
    let mut cursor = 0;

    for capture in pattern.captures_iter(value) {
        let (Some(whole), Some(charset), Some(kind), Some(text)) =
            (capture.get(0), capture.get(1), capture.get(2), capture.get(3))
        else {
            continue;
        };
        let between = &value[cursor..whole.start()];
        if cursor == 0 || !between.trim().is_empty() {
            decoded.push_str(between);
        }
        let bytes = if kind.as_str().eq_ignore_ascii_case("b") {
            STANDARD
                .decode(text.as_str())
                .map_err(|error| IngestError::MailboxParse(error.to_string()))?
        } else {
            decode_quoted_printable(text.as_str(), true)
        };
        decoded.push_str(&decode_charset(&bytes, Some(charset.as_str())));
        cursor = whole.end();
    }
    decoded.push_str(&value[cursor..]);

    Ok(decoded)
}

/// Decodes transfer-decoded bytes in the declared charset. UTF-8, US-ASCII and
/// ISO-8859-1 are understood; any other charset is read as UTF-8 with
/// replacement characters and logged. Unencoded 8-bit bodies are always read
/// as UTF-8 because the mailbox file itself is.
pub fn decode_charset(bytes: &[u8], charset: Option<&str>) -> String {
    let label = charset.unwrap_or("utf-8").trim().to_ascii_lowercase();
    match label.as_str() {
        "utf-8" | "utf8" | "us-ascii" | "ascii" => String::from_utf8_lossy(bytes).into_owned(),
        "iso-8859-1" | "latin1" | "latin-1" => bytes.iter().map(|&byte| char::from(byte)).collect(),
        other => {
            warn!(charset = other, "unsupported charset, decoding as UTF-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn decode_quoted_printable(text: &str, underscore_is_space: bool) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'=' if bytes.get(index + 1) == Some(&b'\n') => index += 2,
            b'=' if bytes.get(index + 1) == Some(&b'\r') && bytes.get(index + 2) == Some(&b'\n') => {
                index += 3
            }
            b'=' => {
                let hex = bytes
                    .get(index + 1..index + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok());
                match hex {
                    Some(byte) => {
                        output.push(byte);
                        index += 3;
                    }
                    None => {
                        output.push(b'=');
                        index += 1;
                    }
                }
            }
            b'_' if underscore_is_space => {
                output.push(b' ');
                index += 1;
            }
            other => {
                output.push(other);
                index += 1;
            }
        }
    }

    output
}
