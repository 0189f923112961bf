//! Content-type derivation shared by the scanner and entry processor:
//! magic-number sniffing of a file's first bytes, and extension-based
//! derivation with a small table of project-specific overrides that
//! `mime_guess` doesn't get right (or doesn't know at all).

pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";
pub const APPLICATION_GZIP: &str = "application/gzip";
pub const APPLICATION_X_GZIP: &str = "application/x-gzip";

/// Overrides applied before falling back to `mime_guess`, keyed by lowercase
/// extension (no leading dot).
const EXTENSION_OVERRIDES: &[(&str, &str)] = &[
    ("unityweb", APPLICATION_OCTET_STREAM),
    ("wasm", "application/wasm"),
    ("data", APPLICATION_OCTET_STREAM),
    ("ico", "image/x-icon"),
];

/// Sniffs a content-type signature from up to the first 512 bytes of a file.
/// Returns `None` if nothing recognizable matched.
pub fn sniff(buf: &[u8]) -> Option<&'static str> {
    infer::get(buf).map(|kind| kind.mime_type())
}

pub fn is_gzip_mime(mime: &str) -> bool {
    mime == APPLICATION_GZIP || mime == APPLICATION_X_GZIP
}

/// Derives a content type from a path's extension: project overrides first,
/// then `mime_guess`. `None` when the path has no extension or `mime_guess`
/// doesn't recognize it, so callers (the entry processor) can fall back to
/// magic-byte sniffing before defaulting to `application/octet-stream`.
pub fn content_type_for_known_extension(path: &str) -> Option<String> {
    let ext = extension_of(path)?;
    let ext_lower = ext.to_ascii_lowercase();
    if let Some((_, mime)) = EXTENSION_OVERRIDES
        .iter()
        .find(|(known, _)| *known == ext_lower)
    {
        return Some((*mime).to_string());
    }
    let mime = mime_guess::from_ext(&ext_lower).first()?;
    if mime.essence_str().starts_with("text/") && mime.get_param("charset").is_none() {
        Some(format!("{mime}; charset=utf-8"))
    } else {
        Some(mime.to_string())
    }
}

/// Derives a content type from a path's extension, falling back to
/// `application/octet-stream` when nothing matches. Text types get an
/// explicit `; charset=utf-8` appended, matching how this service has always
/// served `.txt`/`.html`/`.js`/etc assets.
pub fn content_type_for_path(path: &str) -> String {
    content_type_for_known_extension(path).unwrap_or_else(|| APPLICATION_OCTET_STREAM.to_string())
}

/// Returns the path's extension (the final dot-separated component), or
/// `None` if there isn't one.
pub fn extension_of(path: &str) -> Option<&str> {
    let basename = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = basename.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext)
    }
}

/// Strips the given suffix extension (e.g. `"gz"`) from a path, returning the
/// path with that final extension removed. Used once content-encoding has
/// been derived from an entry's trailing `.gz`/`.br`.
pub fn strip_extension<'a>(path: &'a str, ext: &str) -> &'a str {
    path.strip_suffix(&format!(".{ext}")).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_gets_charset() {
        assert_eq!(content_type_for_path("hello.txt"), "text/plain; charset=utf-8");
    }

    #[test]
    fn binary_has_no_charset() {
        assert_eq!(content_type_for_path("garbage.bin"), APPLICATION_OCTET_STREAM);
    }

    #[test]
    fn override_table_wins_over_mime_guess() {
        assert_eq!(content_type_for_path("game.data"), APPLICATION_OCTET_STREAM);
        assert_eq!(content_type_for_path("bundle.wasm"), "application/wasm");
        assert_eq!(content_type_for_path("favicon.ico"), "image/x-icon");
    }

    #[test]
    fn strip_gz_extension() {
        assert_eq!(strip_extension("gamedata.memgz", "memgz"), "gamedata");
    }

    #[test]
    fn no_extension_defaults_to_octet_stream() {
        assert_eq!(content_type_for_path("README"), APPLICATION_OCTET_STREAM);
    }

    #[test]
    fn sniff_detects_gzip_magic_bytes() {
        let bytes = [0x1Fu8, 0x8B, 0x08, 0, 0, 0, 0, 0];
        let mime = sniff(&bytes).expect("gzip magic recognized");
        assert!(is_gzip_mime(mime));
    }
}
