use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::transfer::ReceivedFile;

#[derive(Debug, Clone)]
pub struct FileInfo {
  pub path: PathBuf,
  pub name: String,
  pub size: u64,
  pub mime: String,
}

pub async fn load_file_info(path: &Path) -> Result<FileInfo> {
  let metadata = tokio::fs::metadata(path)
    .await
    .with_context(|| format!("stat {}", path.display()))?;
  if !metadata.is_file() {
    return Err(anyhow!("{} is not a regular file", path.display()));
  }
  let name = path
    .file_name()
    .and_then(|n| n.to_str())
    .ok_or_else(|| anyhow!("Invalid file name"))?
    .to_string();
  let mime = mime_guess::from_path(path)
    .first_or_octet_stream()
    .essence_str()
    .to_string();
  Ok(FileInfo {
    path: path.to_path_buf(),
    name,
    size: metadata.len(),
    mime,
  })
}

/// Reduces a peer-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
  let candidate = Path::new(name)
    .file_name()
    .and_then(|n| n.to_str())
    .unwrap_or("file");
  let trimmed = candidate.trim();
  if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
    "file".to_string()
  } else {
    trimmed.to_string()
  }
}

/// `report.pdf` -> `report (2).pdf`
fn numbered_name(name: &str, n: u32) -> String {
  match name.rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
    _ => format!("{name} ({n})"),
  }
}

/// First path under `dir` that does not exist yet.
pub async fn available_path(dir: &Path, name: &str) -> Result<PathBuf> {
  let first = dir.join(name);
  if !tokio::fs::try_exists(&first).await? {
    return Ok(first);
  }
  for n in 2..10_000 {
    let path = dir.join(numbered_name(name, n));
    if !tokio::fs::try_exists(&path).await? {
      return Ok(path);
    }
  }
  Err(anyhow!("no free file name for {name} in {}", dir.display()))
}

/// Writes a reassembled file into `dir`, never overwriting an existing one.
pub async fn save_received(dir: &Path, file: &ReceivedFile) -> Result<PathBuf> {
  tokio::fs::create_dir_all(dir)
    .await
    .with_context(|| format!("create {}", dir.display()))?;
  let path = available_path(dir, &sanitize_file_name(&file.name)).await?;
  tokio::fs::write(&path, &file.data)
    .await
    .with_context(|| format!("write {}", path.display()))?;
  Ok(path)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("meshlane-test-{}", uuid::Uuid::new_v4()))
  }

  #[test]
  fn sanitize_strips_directories() {
    assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
    assert_eq!(sanitize_file_name("/abs/path/report.pdf"), "report.pdf");
    assert_eq!(sanitize_file_name(".."), "file");
    assert_eq!(sanitize_file_name("   "), "file");
    assert_eq!(sanitize_file_name("notes.txt"), "notes.txt");
  }

  #[test]
  fn numbering_keeps_extension() {
    assert_eq!(numbered_name("report.pdf", 2), "report (2).pdf");
    assert_eq!(numbered_name("archive.tar.gz", 3), "archive.tar (3).gz");
    assert_eq!(numbered_name("README", 2), "README (2)");
    assert_eq!(numbered_name(".env", 2), ".env (2)");
  }

  #[tokio::test]
  async fn received_files_never_overwrite() {
    let dir = scratch_dir();
    let file = ReceivedFile {
      from: "peer".into(),
      file_id: "f1".into(),
      name: "../hello.txt".into(),
      mime: "text/plain".into(),
      data: b"first".to_vec(),
    };
    let first = save_received(&dir, &file).await.unwrap();
    let second = save_received(
      &dir,
      &ReceivedFile {
        data: b"second".to_vec(),
        ..file.clone()
      },
    )
    .await
    .unwrap();

    assert_eq!(first, dir.join("hello.txt"));
    assert_eq!(second, dir.join("hello (2).txt"));
    assert_eq!(tokio::fs::read(&first).await.unwrap(), b"first");
    assert_eq!(tokio::fs::read(&second).await.unwrap(), b"second");
    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }

  #[tokio::test]
  async fn file_info_guesses_mime() {
    let dir = scratch_dir();
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join("photo.png");
    tokio::fs::write(&path, vec![0u8; 1234]).await.unwrap();

    let info = load_file_info(&path).await.unwrap();
    assert_eq!(info.name, "photo.png");
    assert_eq!(info.size, 1234);
    assert_eq!(info.mime, "image/png");
    assert!(load_file_info(&dir).await.is_err());
    assert!(load_file_info(&dir.join("missing.bin")).await.is_err());
    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }
}
