//! Process-wide MIME classifier, the libmagic stand-in.

use mime_sniffer::MimeTypeSniffer;

/// Sniffs a MIME type from the first chunk of an HTTP body.
///
/// Stateless, so it is trivially safe under per-session serialization.
pub struct MimeClassifier;

impl MimeClassifier {
    pub fn new() -> Self {
        MimeClassifier
    }

    /// Best-effort content type for `data`, without parameters.
    pub fn probe(&self, data: &[u8]) -> Option<String> {
        data.sniff_mime_type()
            .map(|m| m.split(';').next().unwrap_or(m).to_string())
    }
}

impl Default for MimeClassifier {
    fn default() -> Self {
        Self::new()
    }
}
