//! Index cache file path resolution and write policy.
//!
//! Mirrors the path-mangling scheme used by the source library this crate
//! follows: relative paths are mirrored under a cache root so that sources
//! opened by relative or absolute path, or by URL-like strings with
//! characters illegal in a filesystem path, all land at a deterministic,
//! collision-free location.

use std::path::{Path, PathBuf};

/// Policy for whether/where a track's index is persisted to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Never write an index file; always re-index from scratch.
    Disabled,
    /// Write under the cache root, but only once the track is long enough
    /// that re-indexing would be expensive (`>= 100` frames).
    AutoSubTree,
    /// Always write under the cache root.
    AlwaysWriteSubTree,
    /// Write next to the source file (or at an explicit path), but only
    /// once the track is long enough to be worth it.
    AutoAbsolutePath,
    /// Always write next to the source file (or at an explicit path).
    AlwaysAbsolutePath,
}

impl CacheMode {
    fn is_absolute(self) -> bool {
        matches!(self, CacheMode::AutoAbsolutePath | CacheMode::AlwaysAbsolutePath)
    }

    fn is_always(self) -> bool {
        matches!(self, CacheMode::AlwaysWriteSubTree | CacheMode::AlwaysAbsolutePath)
    }
}

/// Whether a just-built index of `frame_count` frames should be persisted
/// under this mode.
pub fn should_write_index(mode: CacheMode, frame_count: usize) -> bool {
    if mode == CacheMode::Disabled {
        return false;
    }
    mode.is_always() || frame_count >= 100
}

/// Characters that are legal in a URL/ffmpeg-protocol source specifier but
/// not in a filesystem path component; replaced the same way across
/// platforms so mangled paths are portable.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '?' | '*' | '<' | '>' | '|' | '"' => '_',
            ':' => '/',
            other => other,
        })
        .collect()
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bsindex")
}

fn mangle(cache_root: &Path, source: &Path) -> PathBuf {
    let sanitized = sanitize_component(&source.to_string_lossy());
    // A sanitized absolute-looking path must not escape the cache root when
    // joined, so strip any leading separators it still carries.
    let relative = sanitized.trim_start_matches(['/', '\\']);
    cache_root.join(relative)
}

/// Resolves the on-disk path for `track`'s index, given the source path and
/// an optional explicit cache location.
///
/// `explicit_path` plays two roles depending on `mode`: for absolute-path
/// modes it's the directory indexes are written directly into (empty means
/// "next to the source file"); for subtree modes it overrides the default
/// cache root.
pub fn resolve(
    mode: CacheMode,
    explicit_path: Option<&Path>,
    source: &Path,
    track: i32,
) -> PathBuf {
    let base = if mode.is_absolute() {
        match explicit_path {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => source.to_path_buf(),
        }
    } else {
        let root = match explicit_path {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => default_cache_root(),
        };
        mangle(&root, source)
    };

    let mut file_name = base.file_name().unwrap_or_default().to_os_string();
    file_name.push(format!(".{track}.bsindex"));
    base.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_mode_never_writes() {
        assert!(!should_write_index(CacheMode::Disabled, 1_000_000));
    }

    #[test]
    fn auto_mode_skips_short_tracks() {
        assert!(!should_write_index(CacheMode::AutoSubTree, 10));
        assert!(should_write_index(CacheMode::AutoSubTree, 100));
    }

    #[test]
    fn always_mode_writes_regardless_of_length() {
        assert!(should_write_index(CacheMode::AlwaysWriteSubTree, 1));
        assert!(should_write_index(CacheMode::AlwaysAbsolutePath, 1));
    }

    #[test]
    fn subtree_path_mangles_colons_and_illegal_chars() {
        let root = PathBuf::from("/tmp/cacheroot");
        let source = Path::new("C:/videos/my?weird<name>.mkv");
        let path = resolve(CacheMode::AutoSubTree, Some(&root), source, 0);
        let s = path.to_string_lossy();
        assert!(s.starts_with("/tmp/cacheroot"));
        assert!(!s.contains('?'));
        assert!(!s.contains('<'));
        assert!(s.ends_with(".0.bsindex"));
    }

    #[test]
    fn absolute_mode_defaults_next_to_source() {
        let source = Path::new("/videos/movie.mkv");
        let path = resolve(CacheMode::AlwaysAbsolutePath, None, source, 1);
        assert_eq!(path, PathBuf::from("/videos/movie.mkv.1.bsindex"));
    }

    #[test]
    fn different_tracks_of_the_same_source_do_not_collide() {
        let source = Path::new("/videos/movie.mkv");
        let a = resolve(CacheMode::AlwaysAbsolutePath, None, source, 0);
        let b = resolve(CacheMode::AlwaysAbsolutePath, None, source, 1);
        assert_ne!(a, b);
    }
}
