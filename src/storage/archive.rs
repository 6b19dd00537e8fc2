//! Tar archive helpers for container filesystem transfer

use crate::error::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;

/// Header carrying the base64 JSON stat of an archive path
pub const PATH_STAT_HEADER: &str = "x-docker-container-path-stat";

/// Stat of a path inside a container filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathStat {
    pub name: String,
    pub size: u64,
    /// Permission bits, plus the directory bit for directories
    pub mode: u32,
    pub mtime: String,
    #[serde(skip)]
    pub is_dir: bool,
}

impl PathStat {
    /// Stat `path` on the host
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let meta = fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());
        let mtime = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let mut mode = meta.permissions().mode() & 0o777;
        if meta.is_dir() {
            // os.ModeDir
            mode |= 1 << 31;
        }
        Ok(Self {
            name,
            size: meta.len(),
            mode,
            mtime,
            is_dir: meta.is_dir(),
        })
    }

    /// Value for [`PATH_STAT_HEADER`]
    pub fn header_value(&self) -> String {
        BASE64.encode(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// Join an archive entry name onto `dest`, dropping `..` and root components
fn entry_target(dest: &Path, name: &Path) -> PathBuf {
    let mut out = dest.to_path_buf();
    for comp in name.components() {
        if let Component::Normal(c) = comp {
            out.push(c);
        }
    }
    out
}

/// Extract a tar stream (optionally gzip-compressed) into `dest`.
///
/// Only directories, regular files and symlinks are materialized.
pub fn extract_tar(data: &[u8], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        return extract_entries(GzDecoder::new(Cursor::new(data)), dest);
    }
    extract_entries(Cursor::new(data), dest)
}

fn extract_entries<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let target = entry_target(dest, &path);
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode | 0o700));
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&target)?;
                io::copy(&mut entry, &mut file)?;
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
            }
            EntryType::Symlink => {
                if let Some(link) = entry.link_name()? {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let _ = fs::remove_file(&target);
                    std::os::unix::fs::symlink(link, &target)?;
                }
            }
            other => debug!("Skipping tar entry {} of type {:?}", path.display(), other),
        }
    }
    Ok(())
}

/// Build a tar of `src`, with entries rooted at `base_name`
pub fn create_tar(src: &Path, base_name: &str) -> Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let meta = fs::metadata(src)?;

    if meta.is_dir() {
        for entry in walkdir::WalkDir::new(src).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
            let name = if rel.as_os_str().is_empty() {
                PathBuf::from(base_name)
            } else {
                Path::new(base_name).join(rel)
            };
            let ft = entry.file_type();
            if ft.is_dir() {
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Directory);
                header.set_mode(entry.metadata().map(|m| m.permissions().mode() & 0o777).unwrap_or(0o755));
                header.set_size(0);
                builder.append_data(&mut header, format!("{}/", name.display()), io::empty())?;
            } else if ft.is_file() {
                let mut file = File::open(entry.path())?;
                builder.append_file(&name, &mut file)?;
            } else if ft.is_symlink() {
                let link = fs::read_link(entry.path())?;
                let mut header = Header::new_gnu();
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder.append_link(&mut header, &name, link)?;
            }
        }
    } else {
        let mut file = File::open(src)?;
        builder.append_file(base_name, &mut file)?;
    }

    Ok(builder.into_inner()?)
}

/// An empty tar stream (two zero blocks)
pub fn empty_tar() -> Vec<u8> {
    vec![0u8; 1024]
}

/// Copy every file under `src` into `dest`, creating directories as needed
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Merge a pre-start staging directory into a process root, then remove it
pub fn merge_staging_dir(staging: &Path, root: &Path) -> Result<()> {
    let result = copy_tree(staging, root);
    let _ = fs::remove_dir_all(staging);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn tar_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_tar_plain_and_gzip() {
        let dir = tempdir().unwrap();
        let data = tar_with(&[("a/b.txt", b"hello")]);
        extract_tar(&data, dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("a/b.txt")).unwrap(), b"hello");

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&tar_with(&[("c.txt", b"zipped")])).unwrap();
        extract_tar(&gz.finish().unwrap(), dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("c.txt")).unwrap(), b"zipped");
    }

    #[test]
    fn test_extract_tar_cannot_escape() {
        let dir = tempdir().unwrap();
        let inner = dir.path().join("inner");
        let mut builder = Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        // bypass tar's own path validation
        header.as_gnu_mut().unwrap().name[..9].copy_from_slice(b"../x.txt\0");
        header.set_cksum();
        builder.append(&header, &b"x"[..]).unwrap();
        extract_tar(&builder.into_inner().unwrap(), &inner).unwrap();
        assert!(inner.join("x.txt").exists());
        assert!(!dir.path().join("x.txt").exists());
    }

    #[test]
    fn test_create_tar_round_trip_directory() {
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/f.txt"), "data").unwrap();

        let tar = create_tar(src.path(), "app").unwrap();
        let out = tempdir().unwrap();
        extract_tar(&tar, out.path()).unwrap();
        assert_eq!(fs::read(out.path().join("app/sub/f.txt")).unwrap(), b"data");
    }

    #[test]
    fn test_path_stat_header() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), "abc").unwrap();
        let stat = PathStat::from_path(&dir.path().join("f")).unwrap();
        assert_eq!(stat.name, "f");
        assert_eq!(stat.size, 3);
        assert!(!stat.is_dir);
        let decoded: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(stat.header_value()).unwrap()).unwrap();
        assert_eq!(decoded["name"], "f");
        assert!(decoded.get("is_dir").is_none());

        let dstat = PathStat::from_path(dir.path()).unwrap();
        assert!(dstat.is_dir);
        assert_ne!(dstat.mode & (1 << 31), 0);
    }

    #[test]
    fn test_merge_staging_dir_removes_staging() {
        let staging = tempdir().unwrap();
        let root = tempdir().unwrap();
        fs::create_dir_all(staging.path().join("etc")).unwrap();
        fs::write(staging.path().join("etc/conf"), "1").unwrap();
        let staging_path = staging.path().to_path_buf();
        merge_staging_dir(&staging_path, root.path()).unwrap();
        assert_eq!(fs::read(root.path().join("etc/conf")).unwrap(), b"1");
        assert!(!staging_path.exists());
    }
}
