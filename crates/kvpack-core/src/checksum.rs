//! SHA-256 digests and `sha256sum`-compatible sidecar files.
//!
//! A sidecar holds one line per file, `<64 lowercase hex>  <file name>\n`,
//! and sits next to the bundle it describes.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::domain::{Artifact, ChecksumError};

/// One `digest  file_name` line of a sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarEntry {
    pub digest: String,
    pub file_name: String,
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String, ChecksumError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// `"{digest}  {file_name}\n"`
pub fn sidecar_line(digest: &str, file_name: &str) -> String {
    format!("{}  {}\n", digest, file_name)
}

/// Path of the sidecar for a bundle at `bundle`.
pub fn sidecar_path(bundle: &Path) -> PathBuf {
    let mut name = bundle.as_os_str().to_owned();
    name.push(crate::domain::target::SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Digest the artifact's bundle and write its sidecar.
///
/// Safe to repeat: an unchanged bundle yields the same digest and an
/// identical sidecar.
pub fn checksum(mut artifact: Artifact) -> Result<Artifact, ChecksumError> {
    let digest = sha256_file(&artifact.path)?;
    let line = sidecar_line(&digest, &artifact.file_name());
    write_atomic(&artifact.sidecar_path(), line.as_bytes())?;

    artifact.size_bytes = std::fs::metadata(&artifact.path)?.len();
    artifact.digest = Some(digest);
    Ok(artifact)
}

/// Parse sidecar text. Blank lines are skipped; `*` binary markers are accepted.
pub fn parse_sidecar(text: &str) -> Result<Vec<SidecarEntry>, ChecksumError> {
    let mut entries = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line_no = index + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let malformed = |reason: &str| ChecksumError::MalformedSidecar {
            line: line_no,
            reason: reason.to_string(),
        };

        let (digest, rest) = raw
            .split_once(' ')
            .ok_or_else(|| malformed("expected `<digest>  <file name>`"))?;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed("digest is not 64 hex characters"));
        }
        let file_name = rest
            .strip_prefix(' ')
            .or_else(|| rest.strip_prefix('*'))
            .ok_or_else(|| malformed("expected two-character separator"))?;
        if file_name.is_empty() {
            return Err(malformed("missing file name"));
        }

        entries.push(SidecarEntry {
            digest: digest.to_ascii_lowercase(),
            file_name: file_name.to_string(),
        });
    }

    if entries.is_empty() {
        return Err(ChecksumError::MalformedSidecar {
            line: 0,
            reason: "no checksum lines".to_string(),
        });
    }
    Ok(entries)
}

/// Check bytes against one sidecar entry.
pub fn verify_bytes(entry: &SidecarEntry, data: &[u8]) -> Result<(), ChecksumError> {
    let actual = sha256_bytes(data);
    if actual == entry.digest {
        Ok(())
    } else {
        Err(ChecksumError::Mismatch {
            file_name: entry.file_name.clone(),
            expected: entry.digest.clone(),
            actual,
        })
    }
}

/// Recompute every file named in a sidecar, resolved next to the sidecar.
pub fn verify_sidecar(sidecar: &Path) -> Result<Vec<SidecarEntry>, ChecksumError> {
    let entries = parse_sidecar(&std::fs::read_to_string(sidecar)?)?;
    let dir = sidecar.parent().unwrap_or_else(|| Path::new("."));

    for entry in &entries {
        let actual = sha256_file(&dir.join(&entry.file_name))?;
        if actual != entry.digest {
            return Err(ChecksumError::Mismatch {
                file_name: entry.file_name.clone(),
                expected: entry.digest.clone(),
                actual,
            });
        }
    }
    Ok(entries)
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BuildTarget;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn bundle_in(dir: &Path, data: &[u8]) -> Artifact {
        let target = BuildTarget::new("ubuntu20.04", "amd64");
        let path = dir.join(target.bundle_name());
        std::fs::write(&path, data).unwrap();
        Artifact {
            target,
            path,
            size_bytes: data.len() as u64,
            digest: None,
        }
    }

    #[test]
    fn test_known_digests() {
        assert_eq!(sha256_bytes(b""), EMPTY_SHA256);
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_checksum_writes_sidecar_line() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = checksum(bundle_in(dir.path(), b"abc")).unwrap();

        let digest = artifact.digest.clone().unwrap();
        assert_eq!(digest.len(), 64);
        let sidecar = std::fs::read_to_string(artifact.sidecar_path()).unwrap();
        assert_eq!(
            sidecar,
            format!("{}  output_ubuntu20.04_amd64.tar.gz\n", digest)
        );
    }

    #[test]
    fn test_parse_sidecar_variants() {
        let text = format!("{}  a.tar.gz\n\n{} *b.tar.gz\n", EMPTY_SHA256, EMPTY_SHA256.to_uppercase());
        let entries = parse_sidecar(&text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].file_name, "b.tar.gz");
        assert_eq!(entries[1].digest, EMPTY_SHA256);
    }

    #[test]
    fn test_parse_sidecar_rejects_garbage() {
        assert!(matches!(
            parse_sidecar("deadbeef  a.tar.gz").unwrap_err(),
            ChecksumError::MalformedSidecar { line: 1, .. }
        ));
        assert!(parse_sidecar("").is_err());
        assert!(parse_sidecar(&format!("{}a.tar.gz", EMPTY_SHA256)).is_err());
    }

    #[test]
    fn test_verify_bytes_detects_mismatch() {
        let entry = SidecarEntry {
            digest: EMPTY_SHA256.to_string(),
            file_name: "a".to_string(),
        };
        assert!(verify_bytes(&entry, b"").is_ok());
        assert!(matches!(
            verify_bytes(&entry, b"x").unwrap_err(),
            ChecksumError::Mismatch { .. }
        ));
    }

    #[test]
    fn test_sidecar_path_appends_suffix() {
        assert_eq!(
            sidecar_path(Path::new("dist/output_a_amd64.tar.gz")),
            PathBuf::from("dist/output_a_amd64.tar.gz.sha256")
        );
    }
}
