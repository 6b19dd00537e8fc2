//! Copying files in and out of containers

use super::Backend;
use crate::error::{Result, SockerlessError};
use crate::storage::archive::PathStat;

/// A tarred path and its stat
pub struct ArchiveOutput {
    pub stat: PathStat,
    pub tar: Vec<u8>,
}

fn require_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(SockerlessError::InvalidParameter(
            "path is required".to_string(),
        ));
    }
    Ok(())
}

impl Backend {
    /// Extract `data` at `path` inside the container
    pub async fn put_archive(&self, reference: &str, path: &str, data: Vec<u8>) -> Result<()> {
        require_path(path)?;
        let c = self.resolve_container(reference)?;
        let fs = self.drivers.filesystem.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || fs.put_archive(&c.id, &path, &data))
            .await
            .map_err(|e| SockerlessError::Server(e.to_string()))?
    }

    pub fn stat_archive_path(&self, reference: &str, path: &str) -> Result<PathStat> {
        require_path(path)?;
        let c = self.resolve_container(reference)?;
        self.drivers.filesystem.stat_path(&c.id, path)
    }

    pub async fn get_archive(&self, reference: &str, path: &str) -> Result<ArchiveOutput> {
        require_path(path)?;
        let c = self.resolve_container(reference)?;
        let fs = self.drivers.filesystem.clone();
        let path = path.to_string();
        let (stat, tar) = tokio::task::spawn_blocking(move || fs.get_archive(&c.id, &path))
            .await
            .map_err(|e| SockerlessError::Server(e.to_string()))??;
        Ok(ArchiveOutput { stat, tar })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{ContainerConfig, ContainerCreateRequest};
    use crate::backend::testing::backend;

    fn tar_of(name: &str, data: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let b = backend();
        let id = b
            .create_container(
                "files",
                "",
                ContainerCreateRequest {
                    config: ContainerConfig {
                        image: "alpine".to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .id;

        b.put_archive("files", "/etc/app", tar_of("app.conf", b"debug=1\n"))
            .await
            .unwrap();
        let stat = b.stat_archive_path(&id, "/etc/app/app.conf").unwrap();
        assert_eq!(stat.name, "app.conf");
        assert_eq!(stat.size, 8);
        assert!(!stat.header_value().is_empty());

        let out = b.get_archive(&id, "/etc/app/app.conf").await.unwrap();
        let mut archive = tar::Archive::new(out.tar.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["app.conf"]);
    }

    #[tokio::test]
    async fn test_errors() {
        let b = backend();
        assert_eq!(
            b.put_archive("ghost", "/tmp", Vec::new()).await.unwrap_err().status_code(),
            404
        );
        assert_eq!(b.stat_archive_path("ghost", "").unwrap_err().status_code(), 400);
    }
}
