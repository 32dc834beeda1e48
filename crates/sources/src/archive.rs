//! Archive extraction and entry-file selection shared by the git, github and
//! object-store fetchers. Extracted files are only read, never executed.

use std::io::{Cursor, Read};

use lambda_core::Language;
use tracing::debug;

use crate::guard::normalize_rel;
use crate::{FetchError, FetchedSource};

/// A regular file relative to the selected source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub data: Vec<u8>,
}

/// Files found in a zipball plus the name of its single top-level directory.
#[derive(Debug, Default)]
pub struct Extracted {
    pub root: Option<String>,
    pub files: Vec<SourceFile>,
}

/// Unpack a zipball, dropping its top-level directory and keeping only files under `subpath`.
///
/// Entries whose names escape the archive root are skipped. The total uncompressed size
/// is capped at `limit` bytes.
pub fn extract_zip(bytes: &[u8], subpath: &str, limit: u64) -> Result<Extracted, FetchError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| FetchError::Remote(format!("invalid zip archive: {e}")))?;
    let prefix = normalize_rel(subpath).ok_or_else(|| FetchError::Remote(format!("invalid subpath '{subpath}'")))?;
    let mut out = Extracted::default();
    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| FetchError::Remote(format!("reading zip entry {i}: {e}")))?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry.enclosed_name().and_then(|p| p.to_str().map(|s| s.replace('\\', "/"))) else {
            debug!(entry = entry.name(), "skipping zip entry outside the archive root");
            continue;
        };
        let Some((root, rel)) = name.split_once('/') else { continue };
        if out.root.is_none() {
            out.root = Some(root.to_string());
        }
        let Some(rel) = normalize_rel(rel) else { continue };
        let rel = if prefix.is_empty() {
            rel
        } else {
            match rel.strip_prefix(&prefix).and_then(|r| r.strip_prefix('/')) {
                Some(r) => r.to_string(),
                None => continue,
            }
        };
        total = total.saturating_add(entry.size());
        if total > limit {
            return Err(FetchError::TooLarge { limit });
        }
        let mut data = Vec::with_capacity(entry.size().min(limit) as usize);
        (&mut entry).take(limit).read_to_end(&mut data).map_err(|e| FetchError::Io(format!("reading {name}: {e}")))?;
        out.files.push(SourceFile { path: rel, data });
    }
    Ok(out)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dirname(path: &str) -> &str {
    path.rsplit_once('/').map(|(d, _)| d).unwrap_or("")
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Index of the best entry-file candidate for `language`, if any.
///
/// Preference: the canonical filename at the root, then the canonical filename at the
/// shallowest depth, then the shallowest `main*`/`index*` file with a matching extension.
pub fn pick_candidate<'a, I>(paths: I, language: Language) -> Option<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let canonical = language.source_filename();
    let mut best: Option<(u8, usize, usize)> = None;
    for (idx, path) in paths.into_iter().enumerate() {
        let base = basename(path);
        let rank = if path == canonical {
            0
        } else if base == canonical {
            1
        } else if (base.starts_with("main") || base.starts_with("index")) && language.extensions().iter().any(|ext| base.ends_with(ext)) {
            2
        } else {
            continue;
        };
        let key = (rank, depth(path), idx);
        if best.map(|b| key < b).unwrap_or(true) {
            best = Some(key);
        }
    }
    best.map(|(_, _, idx)| idx)
}

/// "not found" naming the expected file and up to ten of the files that were seen.
pub fn not_found(language: Language, origin: &str, seen: &[String]) -> FetchError {
    let shown: Vec<&str> = seen.iter().take(10).map(String::as_str).collect();
    let more = if seen.len() > shown.len() { format!(" (+{} more)", seen.len() - shown.len()) } else { String::new() };
    FetchError::NotFound(format!(
        "source file '{}' not found in {}. Found {} files: [{}]{}",
        language.source_filename(),
        origin,
        seen.len(),
        shown.join(", "),
        more
    ))
}

/// Choose the entry file among `files` and pick up a dependency manifest next to it.
pub fn select_source(files: Vec<SourceFile>, language: Language, origin: &str) -> Result<FetchedSource, FetchError> {
    let Some(idx) = pick_candidate(files.iter().map(|f| f.path.as_str()), language) else {
        let seen: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        return Err(not_found(language, origin, &seen));
    };
    let chosen = &files[idx];
    let dir = dirname(&chosen.path);
    let manifest = language.dependency_filename();
    let dependencies = files
        .iter()
        .find(|f| dirname(&f.path) == dir && basename(&f.path) == manifest)
        .map(|f| f.data.clone());
    debug!(origin, entry = %chosen.path, has_dependencies = dependencies.is_some(), "selected entry file");
    Ok(FetchedSource {
        code: chosen.data.clone(),
        filename: language.source_filename().to_string(),
        dependencies,
        revision: None,
    })
}
