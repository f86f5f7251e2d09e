/// Extension used when nothing better is known
pub const FALLBACK_EXTENSION: &str = "bin";

/// Preferred extensions for the media types blobs usually carry. The
///  mime_guess table lists several per type and its first pick is not
///  always the common one (e.g. `jpe` for jpeg).
const PREFERRED: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/avif", "avif"),
    ("image/heic", "heic"),
    ("image/svg+xml", "svg"),
    ("video/mp4", "mp4"),
    ("video/quicktime", "mov"),
    ("video/webm", "webm"),
    ("audio/mpeg", "mp3"),
    ("audio/ogg", "ogg"),
    ("application/json", "json"),
    ("application/pdf", "pdf"),
    ("text/plain", "txt"),
];

/// Pick a file extension for a blob.
///
/// The declared content type wins when it is specific; otherwise the
///  leading bytes are sniffed.
pub fn extension_for(content_type: Option<&str>, bytes: &[u8]) -> &'static str {
    content_type
        .map(essence)
        .filter(|mime| !mime.is_empty() && *mime != "application/octet-stream")
        .and_then(|mime| from_content_type(&mime))
        .or_else(|| sniff(bytes))
        .unwrap_or(FALLBACK_EXTENSION)
}

/// `Image/JPEG; charset=x` -> `image/jpeg`
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn from_content_type(mime: &str) -> Option<&'static str> {
    PREFERRED
        .iter()
        .find(|(known, _)| *known == mime)
        .map(|(_, ext)| *ext)
        .or_else(|| {
            mime_guess::get_mime_extensions_str(mime)
                .and_then(|extensions| extensions.first())
                .copied()
        })
}

fn sniff(bytes: &[u8]) -> Option<&'static str> {
    let ext = match bytes {
        [0xFF, 0xD8, 0xFF, ..] => "jpg",
        [0x89, b'P', b'N', b'G', ..] => "png",
        [b'G', b'I', b'F', b'8', ..] => "gif",
        [b'%', b'P', b'D', b'F', ..] => "pdf",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        [_, _, _, _, b'f', b't', b'y', b'p', b'a', b'v', b'i', b'f', ..] => "avif",
        [_, _, _, _, b'f', b't', b'y', b'p', b'h', b'e', b'i', b'c', ..] => "heic",
        [_, _, _, _, b'f', b't', b'y', b'p', b'q', b't', ..] => "mov",
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => "mp4",
        [0x1A, 0x45, 0xDF, 0xA3, ..] => "webm",
        [b'I', b'D', b'3', ..] => "mp3",
        [b'O', b'g', b'g', b'S', ..] => "ogg",
        _ => return None,
    };
    Some(ext)
}
