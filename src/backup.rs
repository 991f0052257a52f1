use crate::db::DB_FILE_NAME;
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/asistencia.sqlite3";
pub const BUNDLE_FORMAT: &str = "asistencia-workspace-v1";
pub const RAW_SQLITE_FORMAT: &str = "sqlite3";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    exported_at: String,
    db: ManifestDb,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestDb {
    entry: String,
    sha256: String,
    bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub db_sha256: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Copies `src` into `dst`, returning the SHA-256 hex digest and byte count of
/// what was copied.
fn copy_hashed(src: &mut impl Read, dst: &mut impl Write) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok((hex(&hasher.finalize()), total))
}

/// Writes the workspace database into a zip bundle at `out_path`, with a
/// manifest carrying its digest.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!("no attendance database at {}", db_path.display()));
    }
    if let Some(dir) = out_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create backup directory {}", dir.display()))?;
    }

    let bundle = File::create(out_path)
        .with_context(|| format!("cannot create backup {}", out_path.display()))?;
    let mut zip = ZipWriter::new(bundle);
    let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(DB_ENTRY, deflated)
        .context("cannot add database to backup")?;
    let mut source = File::open(&db_path)
        .with_context(|| format!("cannot read {}", db_path.display()))?;
    let (db_sha256, db_bytes) =
        copy_hashed(&mut source, &mut zip).context("cannot copy database into backup")?;

    let manifest = Manifest {
        format: BUNDLE_FORMAT.to_string(),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        db: ManifestDb {
            entry: DB_ENTRY.to_string(),
            sha256: db_sha256.clone(),
            bytes: db_bytes,
        },
    };
    zip.start_file(MANIFEST_ENTRY, deflated)
        .context("cannot add manifest to backup")?;
    serde_json::to_writer_pretty(&mut zip, &manifest).context("cannot write backup manifest")?;
    zip.finish().context("cannot finish backup archive")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        db_sha256,
        db_bytes,
    })
}

/// Replaces the workspace database with the one in `in_path`. Accepts a zip
/// bundle written by [`export_workspace_bundle`] or a bare SQLite file. The
/// bundle's database digest is checked before the existing file is touched.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("cannot create workspace {}", workspace_path.display()))?;
    let target = workspace_path.join(DB_FILE_NAME);

    if !has_zip_signature(in_path)? {
        std::fs::copy(in_path, &target).with_context(|| {
            format!("cannot copy {} over {}", in_path.display(), target.display())
        })?;
        return Ok(ImportSummary {
            bundle_format_detected: RAW_SQLITE_FORMAT.to_string(),
        });
    }

    let bundle = File::open(in_path)
        .with_context(|| format!("cannot read backup {}", in_path.display()))?;
    let mut archive = ZipArchive::new(bundle).context("backup is not a readable zip archive")?;
    let manifest: Manifest = {
        let entry = archive
            .by_name(MANIFEST_ENTRY)
            .context("backup has no manifest")?;
        serde_json::from_reader(entry).context("backup manifest is malformed")?
    };
    if manifest.format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported backup format: {}", manifest.format));
    }

    let staged = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    let (actual_sha, _) = {
        let mut entry = archive
            .by_name(&manifest.db.entry)
            .with_context(|| format!("backup has no entry {}", manifest.db.entry))?;
        let mut out = File::create(&staged)
            .with_context(|| format!("cannot create {}", staged.display()))?;
        let copied = copy_hashed(&mut entry, &mut out).context("cannot extract database")?;
        out.flush().context("cannot flush extracted database")?;
        copied
    };
    if actual_sha != manifest.db.sha256.to_ascii_lowercase() {
        let _ = std::fs::remove_file(&staged);
        return Err(anyhow!(
            "database checksum mismatch: expected {}, got {}",
            manifest.db.sha256,
            actual_sha
        ));
    }

    if target.exists() {
        std::fs::remove_file(&target)
            .with_context(|| format!("cannot remove {}", target.display()))?;
    }
    std::fs::rename(&staged, &target)
        .with_context(|| format!("cannot move restored database to {}", target.display()))?;
    log::debug!(
        "bundle exported at {} by version {} restored",
        manifest.exported_at,
        manifest.app_version
    );

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT.to_string(),
    })
}

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

fn has_zip_signature(path: &Path) -> anyhow::Result<bool> {
    let mut head = [0u8; 4];
    let n = File::open(path)
        .and_then(|mut f| f.read(&mut head))
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(n == 4 && head == ZIP_MAGIC)
}
