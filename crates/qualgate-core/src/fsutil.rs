//! Filesystem utility the executor builds its sandbox layout with.
//!
//! Narrow contract: create directories, write files, symlink a directory's
//! regular files into another directory and remove those symlinks again.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Create a directory and all missing parents. Fails if the final component
/// already exists.
pub fn create_dir(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        return Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("directory already exists: {}", path.display()),
        ));
    }
    fs::create_dir_all(path)
}

/// Write a file's full content.
pub fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, content)
}

/// Overwrite a file's content, falling back to remove-then-rewrite when the
/// existing file refuses writes.
pub fn force_write_file(path: &Path, content: &str) -> std::io::Result<()> {
    match fs::write(path, content) {
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            fs::remove_file(path)?;
            fs::write(path, content)
        }
        other => other,
    }
}

/// Symlink every regular file from `src` into `dst`, skipping names that
/// already exist at the destination.
pub fn link_files(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let target = dst.join(entry.file_name());
        if target.exists() {
            continue;
        }
        std::os::unix::fs::symlink(entry.path(), &target)?;
    }
    Ok(())
}

/// Remove every symlink directly inside `dir`. Regular files are untouched.
pub fn unlink_files(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().symlink_metadata()?.file_type().is_symlink() {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dir_fails_when_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work");
        create_dir(&path).unwrap();
        let err = create_dir(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_create_dir_makes_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c");
        create_dir(&path).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn test_link_files_skips_existing_and_directories() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("data.txt"), "x").unwrap();
        fs::create_dir(src.path().join("subdir")).unwrap();
        fs::write(dst.path().join("existing.txt"), "keep").unwrap();
        fs::write(src.path().join("existing.txt"), "other").unwrap();

        link_files(src.path(), dst.path()).unwrap();

        assert!(dst.path().join("data.txt").symlink_metadata().unwrap().file_type().is_symlink());
        assert!(!dst.path().join("subdir").exists());
        // Pre-existing name untouched.
        assert_eq!(
            fs::read_to_string(dst.path().join("existing.txt")).unwrap(),
            "keep"
        );
    }

    #[test]
    fn test_unlink_files_removes_only_symlinks() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::write(src.path().join("data.txt"), "x").unwrap();
        fs::write(dst.path().join("regular.txt"), "stay").unwrap();
        link_files(src.path(), dst.path()).unwrap();

        unlink_files(dst.path()).unwrap();

        assert!(!dst.path().join("data.txt").exists());
        assert!(dst.path().join("regular.txt").exists());
    }

    #[test]
    fn test_force_write_file_overwrites_readonly() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.txt");
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();

        force_write_file(&path, "new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }
}
