//! Cache busting for emitted HTML.
//!
//! Rewrites local `href`/`src` references to carry a `?v=<token>` query,
//! where the token is derived from the referenced asset's content hash.
//! Re-running over an unchanged HTML/asset set produces byte-identical
//! files, and files whose bytes would not change are never rewritten on
//! disk.

use std::fs;

use camino::Utf8Path;

use crate::cache::BuildCache;
use crate::hash::Hash32;
use crate::paths::AssetClass;
use crate::task::{TaskContext, TaskResult};

/// Rewrite asset references in every emitted HTML file.
///
/// Intended to be called from the action of a dedicated cache-bust task,
/// after the page transform has run.
pub fn bust_outputs(ctx: &TaskContext) -> TaskResult<()> {
    let files = ctx.paths.matches(AssetClass::Html)?;
    let mut cache = ctx.cache.lock().unwrap();

    for file in &files {
        bust_file(file, ctx.out_dir, &cache)?;
        cache.update(file)?;
    }

    Ok(())
}

/// Returns whether the file was rewritten.
pub(crate) fn bust_file(
    file: &Utf8Path,
    out_dir: &Utf8Path,
    cache: &BuildCache,
) -> anyhow::Result<bool> {
    let text = fs::read_to_string(file)?;
    let base = file.parent().unwrap_or(Utf8Path::new("."));

    let rewritten = rewrite_refs(&text, &|target| freshness_token(base, out_dir, target, cache));

    if rewritten != text {
        fs::write(file, rewritten)?;
        return Ok(true);
    }

    Ok(false)
}

fn is_external(target: &str) -> bool {
    target.starts_with("http://")
        || target.starts_with("https://")
        || target.starts_with("//")
        || target.starts_with('#')
        || target.starts_with("mailto:")
        || target.starts_with("data:")
}

/// Token for one referenced asset, or `None` when the reference should be
/// left untouched (external URL, missing file). Root-relative references
/// resolve under the served output root, relative ones next to the page.
fn freshness_token(
    base: &Utf8Path,
    out_dir: &Utf8Path,
    target: &str,
    cache: &BuildCache,
) -> Option<String> {
    let path = match target.strip_prefix('/') {
        Some(rooted) => out_dir.join(rooted),
        None => base.join(target),
    };

    if let Some(hash) = cache.fingerprint_of(&path) {
        return Some(hash.to_token());
    }

    if path.is_file() {
        return Hash32::hash_file(path.as_std_path())
            .ok()
            .map(Hash32::to_token);
    }

    None
}

/// Rewrite every `src="…"` and `href="…"` attribute value through the
/// resolver. A value with a query other than `v=` is left alone, and an
/// existing `v=` token is replaced rather than stacked.
fn rewrite_refs(text: &str, resolve: &dyn Fn(&str) -> Option<String>) -> String {
    const MARKERS: [&str; 2] = ["src=\"", "href=\""];

    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let next = MARKERS
            .iter()
            .filter_map(|marker| rest.find(marker).map(|at| (at, marker.len())))
            .min();

        let Some((at, marker_len)) = next else {
            out.push_str(rest);
            return out;
        };

        let value_start = at + marker_len;
        out.push_str(&rest[..value_start]);
        rest = &rest[value_start..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };

        let value = &rest[..end];
        out.push_str(&bust_value(value, resolve));
        rest = &rest[end..];
    }
}

fn bust_value(value: &str, resolve: &dyn Fn(&str) -> Option<String>) -> String {
    if value.is_empty() || is_external(value) {
        return value.to_string();
    }

    let (path, query) = match value.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (value, None),
    };

    // Unrelated queries are not ours to rewrite.
    if query.is_some_and(|q| !q.starts_with("v=")) {
        return value.to_string();
    }

    match resolve(path) {
        Some(token) => format!("{path}?v={token}"),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use std::fs::File;
    use std::io::Write;

    fn write_file(dir: &Utf8Path, name: &str, content: &[u8]) -> Utf8PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn rewrite_appends_and_replaces_tokens() {
        let resolve = |target: &str| match target {
            "styles.min.css" => Some("abc123".to_string()),
            _ => None,
        };

        let text = r#"<link href="styles.min.css"><script src="gone.js"></script>"#;
        let once = rewrite_refs(text, &resolve);
        assert_eq!(
            once,
            r#"<link href="styles.min.css?v=abc123"><script src="gone.js"></script>"#
        );

        // Idempotent: the stale token is replaced, never stacked.
        let twice = rewrite_refs(&once, &resolve);
        assert_eq!(twice, once);
    }

    #[test]
    fn external_and_queried_refs_left_alone() {
        let resolve = |_: &str| Some("abc123".to_string());

        let text = concat!(
            r#"<a href="https://example.com/a.css">"#,
            r#"<script src="app.js?feature=on"></script>"#,
            "<a href=\"#top\">",
        );

        assert_eq!(rewrite_refs(text, &resolve), text);
    }

    #[test]
    fn bust_file_is_idempotent_on_disk() {
        let (_guard, dir) = tempdir();
        write_file(&dir, "styles.min.css", b"body{}");
        let page = write_file(&dir, "index.html", br#"<link href="styles.min.css">"#);

        let cache = BuildCache::default();

        assert!(bust_file(&page, &dir, &cache).unwrap());
        let first = fs::read(&page).unwrap();

        // Nothing changed underneath, second run must not touch the file.
        assert!(!bust_file(&page, &dir, &cache).unwrap());
        assert_eq!(fs::read(&page).unwrap(), first);
    }

    #[test]
    fn rooted_refs_resolve_against_output_root() {
        let (_guard, dir) = tempdir();
        let out = dir.join("build");
        write_file(&dir, "build/styles.min.css", b"body{}");
        let page = write_file(&dir, "build/index.html", br#"<link href="/styles.min.css">"#);

        let cache = BuildCache::default();

        assert!(bust_file(&page, &out, &cache).unwrap());
        let text = fs::read_to_string(&page).unwrap();
        assert!(text.contains("/styles.min.css?v="));
    }

    #[test]
    fn token_follows_asset_content() {
        let (_guard, dir) = tempdir();
        write_file(&dir, "styles.min.css", b"body{}");
        let page = write_file(&dir, "index.html", br#"<link href="styles.min.css">"#);

        let cache = BuildCache::default();
        bust_file(&page, &dir, &cache).unwrap();
        let before = fs::read_to_string(&page).unwrap();

        write_file(&dir, "styles.min.css", b"body{color:red}");
        assert!(bust_file(&page, &dir, &cache).unwrap());
        let after = fs::read_to_string(&page).unwrap();

        assert_ne!(before, after);
        assert!(after.contains("?v="));
    }
}
