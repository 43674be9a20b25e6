use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::{CacheError, Result};

pub(crate) const SEPARATOR: char = '/';

/// Joins path fragments with exactly one separator at every join point.
///
/// Empty fragments are dropped. A leading separator survives only when the
/// first fragment has one, a trailing separator only when the last non-empty
/// fragment has one. Separators inside a fragment are left alone.
#[must_use]
pub fn join_paths<I, S>(fragments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let fragments: Vec<S> = fragments.into_iter().collect();
    let Some(last) = fragments
        .iter()
        .rposition(|fragment| !fragment.as_ref().is_empty())
    else {
        return String::new();
    };
    let leading = fragments[0].as_ref().starts_with(SEPARATOR);
    let trailing = fragments[last].as_ref().ends_with(SEPARATOR);

    let mut joined = String::new();
    for (index, fragment) in fragments[..=last].iter().enumerate() {
        let mut part = fragment.as_ref();
        if index > 0 {
            part = part.trim_start_matches(SEPARATOR);
        }
        if index < last {
            part = part.trim_end_matches(SEPARATOR);
        }
        if part.is_empty() {
            continue;
        }
        if !joined.is_empty() {
            joined.push(SEPARATOR);
        }
        joined.push_str(part);
    }

    if leading && !joined.starts_with(SEPARATOR) {
        joined.insert(0, SEPARATOR);
    }
    if trailing && !joined.ends_with(SEPARATOR) {
        joined.push(SEPARATOR);
    }
    joined
}

/// Creates every missing ancestor of `target`; the target itself is not touched.
pub fn ensure_directory(target: impl AsRef<Path>) -> Result<()> {
    let target = target.as_ref();
    let Some(parent) = target.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return Ok(());
    };
    // create_dir_all already tolerates a concurrent creator winning the race.
    fs::create_dir_all(parent).map_err(|source| CacheError::io("create directory", parent, source))
}

/// Rejects cache key fragments that could resolve outside the cache root.
pub(crate) fn validate_key(value: &str, allow_empty: bool) -> Result<()> {
    let reject = |reason| {
        Err(CacheError::InvalidKey {
            value: value.to_owned(),
            reason,
        })
    };

    if value.is_empty() {
        return if allow_empty {
            Ok(())
        } else {
            reject("must not be empty")
        };
    }
    if value.starts_with(SEPARATOR) {
        return reject("must be a relative path");
    }
    if value.contains(['\\', ':', '\0']) {
        return reject("contains a forbidden character");
    }
    if value
        .split(SEPARATOR)
        .any(|component| component.is_empty() || component == "." || component == "..")
    {
        return reject("contains an empty or relative component");
    }
    Ok(())
}

pub fn validate_entry(model_id: &str, sub_folder: &str, file_name: &str) -> Result<()> {
    validate_key(model_id, false)?;
    validate_key(sub_folder, true)?;
    validate_key(file_name, false)
}

/// Local cache location for `model_id/sub_folder/file_name` under `cache_root`.
pub fn cache_path(
    cache_root: &Path,
    model_id: &str,
    sub_folder: &str,
    file_name: &str,
) -> Result<PathBuf> {
    validate_entry(model_id, sub_folder, file_name)?;
    Ok(cache_root.join(join_paths([model_id, sub_folder, file_name])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn joins_plain_fragments() {
        assert_eq!(join_paths(["path", "to", "file"]), "path/to/file");
    }

    #[test]
    fn keeps_leading_separator() {
        assert_eq!(join_paths(["/path", "to", "file"]), "/path/to/file");
    }

    #[test]
    fn keeps_trailing_separator() {
        assert_eq!(join_paths(["path", "to", "file/"]), "path/to/file/");
    }

    #[test]
    fn skips_empty_fragments() {
        assert_eq!(join_paths(["path", "", "file"]), "path/file");
        assert_eq!(join_paths(["path", "", "/file"]), "path/file");
    }

    #[test]
    fn normalizes_join_points_only() {
        assert_eq!(join_paths(["a//", "//b", "c"]), "a/b/c");
        assert_eq!(join_paths(["a//b", "c"]), "a//b/c");
        assert_eq!(
            join_paths(["https://huggingface.co/", "org/model/resolve/main/", "config.json"]),
            "https://huggingface.co/org/model/resolve/main/config.json"
        );
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(join_paths(Vec::<&str>::new()), "");
        assert_eq!(join_paths(["", "", ""]), "");
        assert_eq!(join_paths(["//odd//"]), "//odd//");
        assert_eq!(join_paths(["/", "root"]), "/root");
        assert_eq!(join_paths(["", "/not-rooted"]), "not-rooted");
        assert_eq!(join_paths(["dir/", ""]), "dir/");
    }

    #[test]
    fn grouping_does_not_change_result() {
        let cases = [
            ["a", "b", "c"],
            ["/a/", "/b/", "c/"],
            ["a//", "/", "c"],
            ["x/y", "z", "/w"],
        ];
        for [a, b, c] in cases {
            let grouped = join_paths([join_paths([a, b]).as_str(), c]);
            assert_eq!(join_paths([a, b, c]), grouped, "fragments {a:?} {b:?} {c:?}");
        }
    }

    #[test]
    fn ensure_directory_creates_parent_only() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("cache/test/file.txt");

        ensure_directory(&target).unwrap();
        assert!(root.path().join("cache/test").is_dir());
        assert!(!target.exists());

        ensure_directory(&target).unwrap();
        assert!(root.path().join("cache/test").is_dir());
        assert!(!target.exists());
    }

    #[test]
    fn ensure_directory_accepts_bare_file_name() {
        ensure_directory("file.txt").unwrap();
        assert!(!Path::new("file.txt").exists());
    }

    #[test]
    fn ensure_directory_reports_file_in_the_way() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("blocker"), b"x").unwrap();

        let error = ensure_directory(root.path().join("blocker/inner/file.bin")).unwrap_err();
        assert!(matches!(error, CacheError::Io { .. }));
    }

    #[test]
    fn ensure_directory_tolerates_concurrent_callers() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("a/b/c/d/file.bin");
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| ensure_directory(&target).unwrap());
            }
        });
        assert!(root.path().join("a/b/c/d").is_dir());
    }

    #[test]
    fn cache_path_nests_model_and_file() {
        let path = cache_path(Path::new("tests/models"), "model_id", "", "file.txt").unwrap();
        assert_eq!(path, Path::new("tests/models/model_id/file.txt"));

        let path = cache_path(Path::new("root"), "org/model", "onnx", "model.onnx").unwrap();
        assert_eq!(path, Path::new("root/org/model/onnx/model.onnx"));
    }

    #[test]
    fn cache_path_rejects_traversal() {
        let root = Path::new("root");
        for (model, file) in [
            ("..", "file.txt"),
            ("org/../../etc", "passwd"),
            ("model", "../escape"),
            ("/abs", "file.txt"),
            ("model", "C:evil"),
            ("model", "a\\b"),
            ("", "file.txt"),
            ("model", ""),
            ("model//x", "file.txt"),
        ] {
            let error = cache_path(root, model, "", file).unwrap_err();
            assert!(
                matches!(error, CacheError::InvalidKey { .. }),
                "{model:?}/{file:?} was accepted"
            );
        }
        assert!(cache_path(root, "model", "./sub", "f").is_err());
    }
}
