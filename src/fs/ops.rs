use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Replace `path` with `text` through a temp file and rename,
/// so readers never see a partial file.
pub fn write_atomic(path: &Path, text: &str) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut file = fs::File::create(&tmp).with_context(|| format!("creating {tmp:?}"))?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {path:?}"))?;
    Ok(())
}

/// Append one line to `path`, creating it if needed.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {path:?} for append"))?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Remove a file, succeeding if it was never there.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {path:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("file");
        write_atomic(&path, "first")?;
        write_atomic(&path, "second")?;
        assert_eq!("second", fs::read_to_string(&path)?);
        assert!(!dir.path().join("file.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_append_and_remove() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("log");
        append_line(&path, "a")?;
        append_line(&path, "b")?;
        assert_eq!("a\nb\n", fs::read_to_string(&path)?);

        remove_if_exists(&path)?;
        assert!(!path.exists());
        remove_if_exists(&path)?;
        Ok(())
    }
}
