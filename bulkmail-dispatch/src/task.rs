//! The unit of work the dispatch engine consumes, produced by the pipeline
//! adapter.

use bulkmail_common::email::Email;

/// An email attachment: raw bytes plus enough metadata to build a MIME part.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

impl Attachment {
    /// Deduces a MIME content type from the filename's extension, falling
    /// back to sniffing the first 512 bytes for common magic numbers, and
    /// finally to `application/octet-stream`.
    #[must_use]
    pub fn resolved_content_type(&self) -> String {
        if let Some(ct) = &self.content_type {
            return ct.clone();
        }

        if let Some(ext) = self.filename.rsplit('.').next() {
            if let Some(ct) = content_type_for_extension(&ext.to_ascii_lowercase()) {
                return ct.to_string();
            }
        }

        sniff_content_type(&self.bytes[..self.bytes.len().min(512)]).to_string()
    }
}

fn content_type_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "zip" => "application/zip",
        "json" => "application/json",
        _ => return None,
    })
}

fn sniff_content_type(head: &[u8]) -> &'static str {
    match head {
        [0x25, 0x50, 0x44, 0x46, ..] => "application/pdf",
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'P', b'K', 0x03, 0x04, ..] => "application/zip",
        _ => "application/octet-stream",
    }
}

/// A fully-rendered send, ready for the dispatch engine.
#[derive(Debug, Clone)]
pub struct Task {
    pub recipient: Email,
    pub cc: Vec<Email>,
    pub bcc: Vec<Email>,
    pub subject: String,
    pub body_html: Option<String>,
    pub attachments: Vec<Attachment>,
    pub retry_count: u32,
    pub index: usize,
}
