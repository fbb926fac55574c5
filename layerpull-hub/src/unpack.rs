use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, warn};

use crate::error::{HubError, Result};

const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// Gzip magic bytes (1f 8b).
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
/// Zstandard frame magic (28 b5 2f fd).
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Apply one layer archive on top of whatever `dest` already holds.
///
/// Whiteouts remove entries placed by earlier layers. Returns the number of
/// archive entries processed.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> Result<u64> {
    fs::create_dir_all(dest)?;

    let mut archive = Archive::new(decompressor(reader)?);
    // Do not preserve permissions bits that could block later access.
    archive.set_preserve_permissions(false);

    // Hard links whose target hasn't been extracted yet. Retried after the
    // main pass.
    let mut deferred_hardlinks: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut applied: u64 = 0;

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        applied += 1;
        let raw_path = entry.path()?.into_owned();

        let Some(rel_path) = sanitize(&raw_path) else {
            warn!(path = %raw_path.display(), "skipping entry outside destination");
            continue;
        };

        let file_name = match rel_path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => {
                // Root-level entry (e.g. "./").
                continue;
            }
        };
        let rel_parent = rel_path.parent().unwrap_or_else(|| Path::new(""));

        if is_opaque_whiteout(&file_name) {
            let Some(parent) = contained(dest, rel_parent, true)? else {
                warn!(path = %rel_path.display(), "skipping opaque whiteout through symlink");
                continue;
            };
            if parent.is_dir() {
                clear_directory(&parent)?;
            }
            continue;
        }

        if let Some(hidden) = whiteout_target(&file_name) {
            let Some(parent) = contained(dest, rel_parent, true)? else {
                warn!(path = %rel_path.display(), "skipping whiteout through symlink");
                continue;
            };
            let target = parent.join(hidden);
            remove_any(&target)?;
            debug!(path = %target.display(), "applied whiteout");
            continue;
        }

        let Some(target) = contained(dest, &rel_path, false)? else {
            warn!(path = %rel_path.display(), "skipping entry through symlink");
            continue;
        };
        let entry_type = entry.header().entry_type();

        if entry_type == tar::EntryType::Link {
            let link_name = entry
                .header()
                .link_name()?
                .ok_or_else(|| HubError::Layer(format!("hard link {} has no target", rel_path.display())))?;
            let Some(link_rel) = sanitize(&link_name) else {
                warn!(link = %rel_path.display(), "skipping hard link pointing outside destination");
                continue;
            };
            if dest.join(&link_rel).exists() {
                link_inside(dest, &rel_path, &link_rel)?;
            } else {
                deferred_hardlinks.push((rel_path, link_rel));
            }
            continue;
        }

        // A directory may replace a file from an earlier layer and the other
        // way around.
        if let Ok(existing) = fs::symlink_metadata(&target) {
            if entry_type.is_dir() != existing.is_dir() {
                remove_any(&target)?;
            }
        }
        if let Some(p) = target.parent() {
            fs::create_dir_all(p)?;
        }
        entry.unpack(&target)?;
    }

    for (link_rel, target_rel) in &deferred_hardlinks {
        if dest.join(target_rel).exists() {
            if link_inside(dest, link_rel, target_rel)? {
                debug!(
                    link = %link_rel.display(),
                    target = %target_rel.display(),
                    "created deferred hard link",
                );
            }
        } else {
            warn!(
                link = %link_rel.display(),
                target = %target_rel.display(),
                "hard link target still missing after full pass; skipping",
            );
        }
    }

    Ok(applied)
}

// ---------------------------------------------------------------------------
// Whiteout detection helpers
// ---------------------------------------------------------------------------

/// Returns `true` if `name` is a whiteout marker (`.wh.<name>`).
pub fn is_whiteout(name: &str) -> bool {
    name.starts_with(WHITEOUT_PREFIX) && name != OPAQUE_WHITEOUT
}

/// Returns `true` if `name` is an opaque whiteout marker.
pub fn is_opaque_whiteout(name: &str) -> bool {
    name == OPAQUE_WHITEOUT
}

/// Given a whiteout filename (`.wh.foo`), return the name it hides (`foo`).
pub fn whiteout_target(name: &str) -> Option<&str> {
    if is_whiteout(name) {
        name.strip_prefix(WHITEOUT_PREFIX)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sniff the first bytes and wrap `reader` in the matching decoder.
/// Layers are either plain tar, gzip, or zstd.
fn decompressor<'a, R: Read + 'a>(mut reader: R) -> Result<Box<dyn Read + 'a>> {
    let mut head = [0u8; 4];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let sniffed = &head[..filled];
    let rejoined = Cursor::new(sniffed.to_vec()).chain(reader);

    if sniffed.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(GzDecoder::new(rejoined)))
    } else if sniffed == ZSTD_MAGIC {
        let decoder = zstd::Decoder::new(rejoined)
            .map_err(|e| HubError::Layer(format!("zstd init: {}", e)))?;
        Ok(Box::new(decoder))
    } else {
        Ok(Box::new(rejoined))
    }
}

/// Strip leading `/` and `./`, rejecting paths that climb out with `..`.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(out)
}

/// Join `rel` onto `dest`, or `None` when an ancestor that already exists
/// under `dest` is a symlink. With `include_last` the final component is
/// checked too.
fn contained(dest: &Path, rel: &Path, include_last: bool) -> Result<Option<PathBuf>> {
    let components: Vec<Component<'_>> = rel.components().collect();
    let checked = if include_last {
        components.len()
    } else {
        components.len().saturating_sub(1)
    };

    let mut current = dest.to_path_buf();
    for component in &components[..checked] {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(None),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(dest.join(rel)))
}

/// Hard-link `target_rel` to `link_rel`, both under `dest`. Returns `false`
/// when either side resolves through a symlink.
fn link_inside(dest: &Path, link_rel: &Path, target_rel: &Path) -> Result<bool> {
    let (Some(link), Some(target)) = (
        contained(dest, link_rel, false)?,
        contained(dest, target_rel, false)?,
    ) else {
        warn!(link = %link_rel.display(), "skipping hard link through symlink");
        return Ok(false);
    };
    make_hard_link(&target, &link)?;
    Ok(true)
}

fn make_hard_link(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    // Remove stale entry if present.
    let _ = fs::remove_file(link);
    fs::hard_link(target, link)?;
    Ok(())
}

fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Remove all entries inside `dir` but keep the directory itself.
fn clear_directory(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        remove_any(&entry?.path())?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
