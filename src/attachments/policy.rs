use std::path::Path;

use crate::config::AttachmentConfig;

/// Size and content-type admission rules. Blocked entries win over allowed ones.
#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    max_file_size: u64,
    allowed: Vec<String>,
    blocked: Vec<String>,
}

impl AttachmentPolicy {
    pub fn new(max_file_size: u64, allowed: Vec<String>, blocked: Vec<String>) -> Self {
        Self {
            max_file_size,
            allowed,
            blocked,
        }
    }

    pub fn from_config(config: &AttachmentConfig) -> Self {
        Self::new(
            config.max_file_size,
            config.allowed_content_types.clone(),
            config.blocked_content_types.clone(),
        )
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// `Err` carries the skip reason recorded on the attachment.
    pub fn evaluate(
        &self,
        size: i64,
        content_type: Option<&str>,
        filename: &str,
    ) -> Result<(), String> {
        if size > 0 && size as u64 > self.max_file_size {
            return Err(format!(
                "file size {} exceeds limit {}",
                size, self.max_file_size
            ));
        }

        let content_type = effective_content_type(content_type, filename);
        if let Some(ct) = content_type.as_deref() {
            if self.blocked.iter().any(|entry| matches_entry(ct, entry)) {
                return Err(format!("content type {ct} is blocked"));
            }
        }
        if !self.allowed.is_empty() {
            let allowed = content_type
                .as_deref()
                .is_some_and(|ct| self.allowed.iter().any(|entry| matches_entry(ct, entry)));
            if !allowed {
                return Err(format!(
                    "content type {} is not allowed",
                    content_type.as_deref().unwrap_or("unknown")
                ));
            }
        }
        Ok(())
    }
}

// "image/png" matches itself, "image" and "image/*" match the whole family.
fn matches_entry(content_type: &str, entry: &str) -> bool {
    let entry = entry.trim_end_matches('*').trim_end_matches('/');
    if entry.is_empty() {
        return false;
    }
    content_type == entry
        || content_type
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Declared type without parameters, or a guess from the file extension.
pub fn effective_content_type(declared: Option<&str>, filename: &str) -> Option<String> {
    let declared = declared
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty() && v != "application/octet-stream");
    declared.or_else(|| guess_mime_from_filename(filename).map(str::to_string))
}

fn guess_mime_from_filename(filename: &str) -> Option<&'static str> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "svg" => Some("image/svg+xml"),
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "mp3" => Some("audio/mpeg"),
        "ogg" => Some("audio/ogg"),
        "wav" => Some("audio/wav"),
        "pdf" => Some("application/pdf"),
        "txt" => Some("text/plain"),
        "zip" => Some("application/zip"),
        "exe" => Some("application/x-msdownload"),
        _ => None,
    }
}
