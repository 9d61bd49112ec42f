use std::path::{Path, PathBuf};

use crate::{document::FileType, error::Result};

/// A candidate document file found under a root directory.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Path relative to the root directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

/// A directory or entry that could not be read during a walk.
#[derive(Debug, Clone)]
pub struct Unreadable {
    pub path: PathBuf,
    pub reason: String,
}

/// Everything one walk found.
#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<DiscoveredFile>,
    pub unreadable: Vec<Unreadable>,
}

impl Discovery {
    fn unreadable(&mut self, path: &Path, error: std::io::Error) {
        tracing::warn!(path = %path.display(), %error, "skipping unreadable entry");
        self.unreadable.push(Unreadable {
            path: path.to_path_buf(),
            reason: error.to_string(),
        });
    }
}

/// Walk a directory and return files with a supported extension.
///
/// Hidden files and directories (names starting with `.`) are skipped.
/// Subdirectories are only entered when `recursive` is set. Results are
/// sorted by relative path so repeated walks yield the same order.
///
/// Only a root that cannot be opened is an error. Unreadable
/// subdirectories and entries are logged, listed in
/// [`Discovery::unreadable`] and walked past.
pub fn discover_files(root: &Path, recursive: bool) -> Result<Discovery> {
    let canonical_root = root.canonicalize()?;
    let entries = std::fs::read_dir(&canonical_root)?;

    let mut discovery = Discovery::default();
    walk_dir(&canonical_root, &canonical_root, entries, recursive, &mut discovery);
    discovery
        .files
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    discovery.unreadable.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(discovery)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    entries: std::fs::ReadDir,
    recursive: bool,
    out: &mut Discovery,
) {
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                out.unreadable(current, e);
                continue;
            }
        };
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                out.unreadable(&path, e);
                continue;
            }
        };

        if file_type.is_dir() {
            if recursive {
                match std::fs::read_dir(&path) {
                    Ok(sub) => walk_dir(root, &path, sub, recursive, out),
                    Err(e) => out.unreadable(&path, e),
                }
            }
        } else if file_type.is_symlink() {
            let Ok(resolved) = path.canonicalize() else {
                tracing::debug!(path = %path.display(), "skipping broken symlink");
                continue;
            };
            // Directory links are never followed to avoid cycles.
            if resolved.is_file() && FileType::from_path(&resolved).is_some() {
                out.files.push(discovered(root, &path, resolved));
            }
        } else if file_type.is_file() && FileType::from_path(&path).is_some()
        {
            match path.canonicalize() {
                Ok(abs) => out.files.push(discovered(root, &path, abs)),
                Err(e) => out.unreadable(&path, e),
            }
        }
    }
}

fn discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: PathBuf,
) -> DiscoveredFile {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();

    DiscoveredFile {
        relative_path,
        absolute_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(files: &[DiscoveredFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn filters_by_supported_extension() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("note.md"), "# Hello").unwrap();
        std::fs::write(tmp.path().join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(tmp.path().join("image.png"), "binary").unwrap();
        std::fs::write(tmp.path().join("data.json"), "{}").unwrap();

        let files = discover_files(tmp.path(), true).unwrap().files;
        assert_eq!(names(&files), vec!["main.rs", "note.md"]);
    }

    #[test]
    fn skips_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join(".git");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("config.md"), "git config").unwrap();
        std::fs::write(tmp.path().join(".hidden.md"), "secret").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "notes").unwrap();

        let files = discover_files(tmp.path(), true).unwrap().files;
        assert_eq!(names(&files), vec!["notes.md"]);
    }

    #[test]
    fn recursion_is_optional() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("subdir");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("deep.txt"), "deep").unwrap();
        std::fs::write(tmp.path().join("top.txt"), "top").unwrap();

        let flat = discover_files(tmp.path(), false).unwrap().files;
        assert_eq!(names(&flat), vec!["top.txt"]);

        let deep = discover_files(tmp.path(), true).unwrap().files;
        assert_eq!(names(&deep), vec!["subdir/deep.txt", "top.txt"]);
    }

    #[test]
    fn results_are_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("z.md"), "z").unwrap();
        std::fs::write(tmp.path().join("a.md"), "a").unwrap();
        std::fs::write(tmp.path().join("m.md"), "m").unwrap();

        let files = discover_files(tmp.path(), true).unwrap().files;
        assert_eq!(names(&files), vec!["a.md", "m.md", "z.md"]);
        assert!(files.iter().all(|f| f.absolute_path.is_absolute()));
    }

    #[test]
    fn empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let discovery = discover_files(tmp.path(), true).unwrap();
        assert!(discovery.files.is_empty());
        assert!(discovery.unreadable.is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover_files(&tmp.path().join("gone"), true).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_subdirectory_is_walked_past() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "b").unwrap();
        let locked = tmp.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("inner.txt"), "hidden").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000))
            .unwrap();
        // Privileged users can still read the directory.
        let denied = std::fs::read_dir(&locked).is_err();

        let discovery = discover_files(tmp.path(), true);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755))
            .unwrap();
        let discovery = discovery.unwrap();

        let found = names(&discovery.files);
        assert!(found.starts_with(&["a.txt".to_string(), "b.txt".to_string()]));
        if denied {
            assert_eq!(found.len(), 2);
            assert_eq!(discovery.unreadable.len(), 1);
            assert!(discovery.unreadable[0].path.ends_with("locked"));
        } else {
            assert!(discovery.unreadable.is_empty());
        }
    }
}
