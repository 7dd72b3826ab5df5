/// Filesystem helpers shared by the build and ffmpeg flows.
pub mod fs {
    use std::fs;
    use std::io;

    use camino::Utf8Path;

    /// Ensure a directory exists, creating it recursively if needed.
    pub fn ensure_dir(path: &Utf8Path) -> io::Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    /// Remove a file or directory tree. Returns whether anything was removed.
    pub fn remove_if_exists(path: &Utf8Path) -> io::Result<bool> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(true)
    }
}


#[cfg(test)]
mod tests {
    use super::fs::remove_if_exists;
    use super::testing::unique_temp_dir;

    #[test]
    fn remove_if_exists_handles_files_dirs_and_absence() {
        let root = unique_temp_dir("util-remove");
        let dir = root.join("build").join("nested");
        std::fs::create_dir_all(&dir).unwrap();
        let file = root.join("app.spec");
        std::fs::write(&file, "spec").unwrap();

        assert!(remove_if_exists(&root.join("build")).unwrap());
        assert!(remove_if_exists(&file).unwrap());
        assert!(!remove_if_exists(&file).unwrap());
        assert!(!root.join("build").exists());

        let _ = std::fs::remove_dir_all(&root);
    }
}
