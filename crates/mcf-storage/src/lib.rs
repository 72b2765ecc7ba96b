//! Atomic output storage and result serializers (vCard, CSV) for MCF.

use std::path::{Component, Path, PathBuf};

use mcf_core::Identity;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mcf-storage";

const VCARD_LINE_LIMIT: usize = 75;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("output path {} must be relative and stay inside the output root", .0.display())]
    InvalidPath(PathBuf),
    #[error("serializing csv: {0}")]
    Csv(#[from] csv::Error),
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> OutputError + 'a {
    move |source| OutputError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct StoredOutput {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The file already existed with identical content and was left untouched.
    pub unchanged: bool,
}

/// Writes run outputs under a root directory via temp-file + rename.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Atomically replaces `relative_path` with `bytes`; readers never observe a partial file.
    pub async fn write_bytes(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> Result<StoredOutput, OutputError> {
        let relative_path = relative_path.as_ref().to_path_buf();
        if relative_path.as_os_str().is_empty()
            || !relative_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(OutputError::InvalidPath(relative_path));
        }
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.root.join(&relative_path);
        let Some(parent) = absolute_path.parent().map(Path::to_path_buf) else {
            return Err(OutputError::InvalidPath(relative_path));
        };

        fs::create_dir_all(&parent)
            .await
            .map_err(io_err("creating output directory", &parent))?;

        if let Ok(existing) = fs::read(&absolute_path).await {
            if Self::sha256_hex(&existing) == content_hash {
                return Ok(StoredOutput {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err("opening temp output file", &temp_path))?;
        file.write_all(bytes)
            .await
            .map_err(io_err("writing temp output file", &temp_path))?;
        file.flush()
            .await
            .map_err(io_err("flushing temp output file", &temp_path))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(OutputError::Io {
                action: "renaming temp output into place",
                path: absolute_path,
                source,
            });
        }

        debug!(path = %absolute_path.display(), bytes = bytes.len(), "wrote output");
        Ok(StoredOutput {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }
}

fn escape_vcard_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            ';' => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(ch),
        }
    }
    out
}

/// Folds a content line at 75 octets without splitting a UTF-8 sequence.
fn fold_vcard_line(line: &str, out: &mut String) {
    let mut width = 0;
    for ch in line.chars() {
        let len = ch.len_utf8();
        if width + len > VCARD_LINE_LIMIT {
            out.push_str("\r\n ");
            width = 1;
        }
        out.push(ch);
        width += len;
    }
    out.push_str("\r\n");
}

/// Serializes identities as vCard 3.0, one card per identity, in the given order.
pub fn render_vcards(identities: &[Identity]) -> String {
    let mut out = String::new();
    for identity in identities {
        let name = escape_vcard_text(&identity.name);
        fold_vcard_line("BEGIN:VCARD", &mut out);
        fold_vcard_line("VERSION:3.0", &mut out);
        fold_vcard_line(&format!("FN:{name}"), &mut out);
        fold_vcard_line(&format!("N:;{name};;;"), &mut out);
        fold_vcard_line(&format!("TEL;TYPE=CELL:{}", identity.phone), &mut out);
        fold_vcard_line("END:VCARD", &mut out);
    }
    out
}

/// Serializes identities as a `name,phone` CSV table.
pub fn render_csv(identities: &[Identity]) -> Result<Vec<u8>, OutputError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["name", "phone"])?;
    for identity in identities {
        writer.write_record([identity.name.as_str(), identity.phone.as_str()])?;
    }
    writer.into_inner().map_err(|e| OutputError::Io {
        action: "flushing csv buffer",
        path: PathBuf::from("<memory>"),
        source: e.into_error(),
    })
}
