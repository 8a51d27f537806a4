//! Filename extension ↔ content type table.

/// Known extensions and their content types. First match wins for the
/// reverse lookup, so preferred extensions come first.
const TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("pdf", "application/pdf"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("csv", "text/csv"),
    ("xml", "text/xml"),
    ("json", "application/json"),
    ("ps", "application/postscript"),
    ("zip", "application/zip"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("odt", "application/vnd.oasis.opendocument.text"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
];

/// Generic binary type used when nothing better is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Guess a content type from a filename's extension.
pub fn content_type_for(filename: &str) -> &'static str {
    let Some((_, ext)) = filename.rsplit_once('.') else {
        return OCTET_STREAM;
    };
    TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map_or(OCTET_STREAM, |(_, ctype)| ctype)
}

/// Preferred extension (without dot) for a content type.
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let bare = content_type.split(';').next().unwrap_or_default().trim();
    TYPES
        .iter()
        .find(|(_, ctype)| ctype.eq_ignore_ascii_case(bare))
        .map(|(ext, _)| *ext)
}
