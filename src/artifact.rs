//! Minimal deployable packages.
//!
//! Environments without dependencies are deployed from a zip that holds
//! only the remote entrypoint. Building dependency bundles is done remotely
//! by the bootstrap environment, not here.

use std::io::{Cursor, Write};

use zip::write::SimpleFileOptions;

use crate::alias::digest_parts;
use crate::error::DeployError;

/// Permissions of the entrypoint inside the archive (read + execute).
pub const ENTRYPOINT_MODE: u32 = 0o555;

/// Produces the minimal archive for dependency-free environments.
pub trait ArtifactBuilder: Send + Sync {
    fn minimal_package(&self) -> Result<Vec<u8>, DeployError>;

    /// Digest of the entrypoint this builder deploys.
    ///
    /// Must change whenever the packaged entrypoint changes, since it feeds
    /// every alias.
    fn fingerprint(&self) -> String;
}

/// Packages one entrypoint file into a deflated zip.
#[derive(Debug, Clone)]
pub struct ZipArtifactBuilder {
    entrypoint_name: String,
    source: Vec<u8>,
}

impl ZipArtifactBuilder {
    pub fn new(entrypoint_name: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            entrypoint_name: entrypoint_name.into(),
            source: source.into(),
        }
    }

    pub fn entrypoint_name(&self) -> &str {
        &self.entrypoint_name
    }
}

impl ArtifactBuilder for ZipArtifactBuilder {
    fn minimal_package(&self) -> Result<Vec<u8>, DeployError> {
        let package_err = |e: zip::result::ZipError| DeployError::Package {
            message: e.to_string(),
        };

        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(ENTRYPOINT_MODE);

        zip.start_file(self.entrypoint_name.as_str(), options)
            .map_err(package_err)?;
        zip.write_all(&self.source)
            .map_err(|e| DeployError::Package {
                message: e.to_string(),
            })?;

        let cursor = zip.finish().map_err(package_err)?;
        Ok(cursor.into_inner())
    }

    fn fingerprint(&self) -> String {
        digest_parts(&[self.entrypoint_name.as_bytes(), &self.source])
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn package_holds_the_entrypoint() {
        let builder =
            ZipArtifactBuilder::new("main.py", b"def lambda_handler(e, c): pass\n".to_vec());
        let bytes = builder.minimal_package().unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);

        let mut file = archive.by_name("main.py").unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "def lambda_handler(e, c): pass\n");
        assert_eq!(file.unix_mode().map(|m| m & 0o777), Some(ENTRYPOINT_MODE));
    }

    #[test]
    fn fingerprint_follows_the_entrypoint() {
        let a = ZipArtifactBuilder::new("main.py", b"v1".to_vec());
        let b = ZipArtifactBuilder::new("main.py", b"v2".to_vec());
        let renamed = ZipArtifactBuilder::new("handler.py", b"v1".to_vec());

        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), renamed.fingerprint());
    }
}
