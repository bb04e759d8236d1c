//! Filesystem helpers shared by the blob store and the lifecycle manager.
//!
//! Tree walks use an explicit work stack so deep or hostile directory trees
//! cannot exhaust the call stack.

use crate::errors::{BulkOutcome, StoreError, StoreResult};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Extension of in-flight atomic writes
pub(crate) const TEMP_EXTENSION: &str = "tmp";

/// Write file atomically (write to temp, then rename)
///
/// Every call writes its own uniquely named temp file next to `path`, so
/// concurrent writers to one path never share bytes; the last rename wins.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> StoreResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let stem = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = format!(".{}.", stem);
    let suffix = format!(".{}", TEMP_EXTENSION);

    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(&suffix)
        .tempfile_in(parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;

    // A failed persist drops the temp file, which deletes it
    temp.persist(path).map_err(|e| StoreError::from(e.error))?;
    Ok(())
}

pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == TEMP_EXTENSION)
}

/// Remove a file, treating "already gone" as success
pub(crate) fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Sum of the sizes of every regular file under `root`. A missing root is 0.
pub(crate) fn dir_size(root: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(entry.path()),
                Ok(ft) if ft.is_file() => {
                    total += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
                _ => {}
            }
        }
    }

    total
}

/// Delete `root` with everything below it.
///
/// Every entry is attempted even after failures. Returns an outcome whose
/// `root_found` is false when the directory did not exist.
pub(crate) fn remove_tree(root: &Path) -> BulkOutcome {
    if !root.is_dir() {
        return BulkOutcome::missing_root();
    }

    let mut outcome = BulkOutcome::new();
    // Directories in discovery order; removed in reverse so children go first
    let mut dirs = vec![root.to_path_buf()];
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                outcome.record_failure(&dir, e.into());
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    outcome.record_failure(&dir, e.into());
                    continue;
                }
            };
            let path = entry.path();
            let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            if is_dir {
                dirs.push(path.clone());
                stack.push(path);
            } else {
                match fs::remove_file(&path) {
                    Ok(()) => outcome.record_success(),
                    Err(e) => outcome.record_failure(&path, e.into()),
                }
            }
        }
    }

    for dir in dirs.iter().rev() {
        match fs::remove_dir(dir) {
            Ok(()) => outcome.record_success(),
            Err(e) => outcome.record_failure(dir, e.into()),
        }
    }

    outcome
}

/// Regular files directly inside `dir` whose name satisfies `predicate`.
/// A missing directory yields an empty list.
pub(crate) fn list_files<F>(dir: &Path, predicate: F) -> io::Result<Vec<PathBuf>>
where
    F: Fn(&str) -> bool,
{
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if predicate(name) {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Subdirectories directly inside `dir`
pub(crate) fn list_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("soupelt_1");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");

        let leftovers = list_files(dir.path(), |name| name != "soupelt_1").unwrap();
        assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
    }

    #[test]
    fn test_concurrent_writers_use_separate_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("soupelt_7");
        let long = vec![b'a'; 64 * 1024];
        let short = b"short".to_vec();

        for _ in 0..20 {
            let writers: Vec<_> = [long.clone(), short.clone()]
                .into_iter()
                .map(|data| {
                    let path = path.clone();
                    std::thread::spawn(move || write_atomic(&path, &data))
                })
                .collect();
            for writer in writers {
                writer.join().unwrap().unwrap();
            }

            let content = fs::read(&path).unwrap();
            assert!(content == long || content == short);
        }
    }

    #[test]
    fn test_temp_file_names() {
        assert!(is_temp_file(Path::new("/x/.soupelt_1.a1B2c3.tmp")));
        assert!(!is_temp_file(Path::new("/x/soupelt_1")));
    }

    #[test]
    fn test_dir_size_nested() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        fs::write(dir.path().join("top"), [0u8; 10]).unwrap();
        fs::write(nested.join("deep"), [0u8; 32]).unwrap();

        assert_eq!(dir_size(dir.path()), 42);
        assert_eq!(dir_size(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_remove_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("t1")).unwrap();
        fs::create_dir_all(root.join("t2").join("inner")).unwrap();
        fs::write(root.join("t1").join("f"), b"x").unwrap();
        fs::write(root.join("t2").join("inner").join("g"), b"y").unwrap();

        let outcome = remove_tree(&root);
        assert!(outcome.succeeded());
        assert!(!root.exists());

        let again = remove_tree(&root);
        assert!(!again.root_found);
        assert!(!again.succeeded());
    }

    #[test]
    fn test_remove_tree_deep_chain() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("deep");
        let mut path = root.clone();
        for i in 0..200 {
            path = path.join(format!("d{}", i));
        }
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("leaf"), b"z").unwrap();

        assert_eq!(dir_size(&root), 1);
        assert!(remove_tree(&root).succeeded());
        assert!(!root.exists());
    }

    #[test]
    fn test_list_files_filters() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.db"), b"").unwrap();
        fs::write(dir.path().join("b.db"), b"").unwrap();
        fs::write(dir.path().join("c.txt"), b"").unwrap();
        fs::create_dir(dir.path().join("d.db")).unwrap();

        let files = list_files(dir.path(), |name| name.ends_with(".db")).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.db", "b.db"]);

        assert!(list_files(&dir.path().join("missing"), |_| true).unwrap().is_empty());
    }

    #[test]
    fn test_remove_file_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"").unwrap();
        remove_file_if_exists(&path).unwrap();
        remove_file_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
