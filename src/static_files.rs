//! Static bundle resolution.
//!
//! Maps request paths onto a host's source directory without ever escaping
//! it: paths are percent-decoded, rebuilt component by component, and any
//! `..` component rejects the request outright. Directory requests resolve
//! to the directory's `index.html`.

use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};

/// Decode and normalize a request path into a relative path safe to join
/// onto a source directory. `None` means the path tried to traverse out.
pub fn sanitize_request_path(request_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(request_path).decode_utf8().ok()?;
    let mut clean = PathBuf::new();
    for component in decoded.split('/') {
        match component {
            "" | "." => continue,
            ".." => return None,
            component => clean.push(component),
        }
    }
    Some(clean)
}

/// Resolve a request path to an existing file inside `source_dir`. A
/// directory resolves to its `index.html` when present. No SPA fallback
/// here; callers decide what a miss means.
pub fn resolve_existing(source_dir: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = sanitize_request_path(request_path)?;
    let candidate = source_dir.join(relative);
    if candidate.is_file() {
        return Some(candidate);
    }
    if candidate.is_dir() {
        let index = candidate.join("index.html");
        if index.is_file() {
            return Some(index);
        }
    }
    None
}

/// The SPA entrypoint for a host, if it exists.
pub fn index_html(source_dir: &Path) -> Option<PathBuf> {
    let index = source_dir.join("index.html");
    index.is_file().then_some(index)
}

/// Content type by extension; the bundle layout is known so a table beats a
/// content sniffer.
pub fn mime_from_extension(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("webmanifest") => "application/manifest+json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("map") => "application/json; charset=utf-8",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("index.html"), "<html>spa</html>").unwrap();
        std::fs::create_dir_all(tmp.path().join("static/js")).unwrap();
        std::fs::write(tmp.path().join("static/js/main.js"), "console.log(1)").unwrap();
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/index.html"), "<html>docs</html>").unwrap();
        tmp
    }

    #[test]
    fn traversal_components_are_rejected() {
        assert!(sanitize_request_path("/../../etc/passwd").is_none());
        assert!(sanitize_request_path("/static/../../secret").is_none());
        // Percent-encoded traversal decodes before the check.
        assert!(sanitize_request_path("/%2e%2e/%2e%2e/etc/passwd").is_none());
        assert!(sanitize_request_path("/a/%2E%2E/b").is_none());
    }

    #[test]
    fn normal_paths_are_normalized() {
        assert_eq!(
            sanitize_request_path("/static//js/./main.js"),
            Some(PathBuf::from("static/js/main.js"))
        );
        assert_eq!(sanitize_request_path("/"), Some(PathBuf::new()));
    }

    #[test]
    fn existing_files_resolve() {
        let tmp = bundle();
        let resolved = resolve_existing(tmp.path(), "/static/js/main.js").unwrap();
        assert!(resolved.ends_with("static/js/main.js"));
    }

    #[test]
    fn directories_resolve_to_their_index() {
        let tmp = bundle();
        let resolved = resolve_existing(tmp.path(), "/docs").unwrap();
        assert!(resolved.ends_with("docs/index.html"));
        // The source root itself also resolves to index.html.
        let resolved = resolve_existing(tmp.path(), "/").unwrap();
        assert!(resolved.ends_with("index.html"));
    }

    #[test]
    fn missing_files_do_not_resolve() {
        let tmp = bundle();
        assert!(resolve_existing(tmp.path(), "/nope.js").is_none());
        assert!(resolve_existing(tmp.path(), "/about").is_none());
    }

    #[test]
    fn traversal_never_resolves_outside_the_source() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("app");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "keep out").unwrap();
        assert!(resolve_existing(&source, "/../secret.txt").is_none());
    }

    #[test]
    fn mime_table_covers_bundle_assets() {
        assert_eq!(
            mime_from_extension(Path::new("index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            mime_from_extension(Path::new("a/main.js")),
            "application/javascript; charset=utf-8"
        );
        assert_eq!(mime_from_extension(Path::new("f.woff2")), "font/woff2");
        assert_eq!(
            mime_from_extension(Path::new("unknown.bin")),
            "application/octet-stream"
        );
    }
}
