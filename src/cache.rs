//! Locating artifacts in the on-disk cache.
//!
//! Models live in a HuggingFace hub-style cache:
//!
//! ```text
//! <root>/hub/models--<org>--<name>/snapshots/<revision-or-hash>/<files>
//! <root>/hub/models--<org>--<name>/refs/<name>   (contains a commit hash)
//! ```
//!
//! A model is only considered cached when the resolved snapshot holds weights. A
//! snapshot with nothing but `config.json` is what a metadata probe leaves behind and
//! does not count. None of these functions fail: anything missing or unreadable simply
//! means "not cached".

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Where the host-side cache root is mounted inside containers.
pub const DEFAULT_CONTAINER_CACHE: &str = "/root/.cache/huggingface";

/// File suffixes that mark a snapshot as holding actual weights.
const WEIGHT_SUFFIXES: &[&str] = &[
    ".safetensors",
    ".bin",
    ".pt",
    ".pth",
    ".ckpt",
    ".onnx",
    ".msgpack",
    ".h5",
    ".gguf",
];

/// A model identifier split into repository and quantization selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub repo_id: String,
    pub quant: Option<String>,
}

/// Splits `org/name:QUANT` on the last colon.
pub fn parse_model_spec(id: &str) -> ModelSpec {
    match id.rsplit_once(':') {
        Some((repo_id, quant)) => ModelSpec {
            repo_id: repo_id.to_owned(),
            quant: Some(quant.to_owned()),
        },
        None => ModelSpec {
            repo_id: id.to_owned(),
            quant: None,
        },
    }
}

/// Whether `id` names a GGUF model: it carries a quant selector, or its repository
/// name mentions GGUF in any case.
pub fn is_gguf(id: &str) -> bool {
    let spec = parse_model_spec(id);
    spec.quant.is_some() || spec.repo_id.to_lowercase().contains("gguf")
}

/// Cache directory of the repository `id` belongs to. The quant selector picks files,
/// not directories, so it does not affect the path.
pub fn cache_path(id: &str, cache_root: &Path) -> PathBuf {
    let spec = parse_model_spec(id);
    cache_root
        .join("hub")
        .join(format!("models--{}", spec.repo_id.replace('/', "--")))
}

/// Path of the tarball an image is saved to before it is pushed to hosts.
pub fn image_archive_path(image: &str, cache_root: &Path) -> PathBuf {
    let name: String = image
        .chars()
        .map(|c| if c == '/' || c == ':' || c == '@' { '_' } else { c })
        .collect();
    cache_root.join("images").join(format!("{}.tar", name))
}

fn snapshot_dirs(entry: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = match fs::read_dir(entry.join("snapshots")) {
        Ok(read_dir) => read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => return Vec::new(),
    };
    dirs.sort();
    dirs
}

fn file_name_lower(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_lowercase())
}

fn files_under(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
}

fn is_gguf_match(path: &Path, quant: Option<&str>) -> bool {
    match file_name_lower(path) {
        Some(name) if name.ends_with(".gguf") => match quant {
            Some(quant) => name.contains(&quant.to_lowercase()),
            None => true,
        },
        _ => false,
    }
}

fn has_weights(snapshot: &Path) -> bool {
    files_under(snapshot).any(|path| match file_name_lower(&path) {
        Some(name) => WEIGHT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)),
        None => false,
    })
}

/// Smallest matching file by name (then full path) under `snapshots`.
fn first_gguf<'a, I>(snapshots: I, quant: Option<&str>) -> Option<PathBuf>
where
    I: IntoIterator<Item = &'a PathBuf>,
{
    snapshots
        .into_iter()
        .flat_map(|snapshot| files_under(snapshot))
        .filter(|path| is_gguf_match(path, quant))
        .min_by(|a, b| a.file_name().cmp(&b.file_name()).then_with(|| a.cmp(b)))
}

/// Finds the `.gguf` file `id` refers to anywhere under the entry's snapshots, in flat
/// or per-quant subdirectory layouts. With several matching shards the
/// lexicographically smallest file name is returned.
pub fn resolve_gguf_file(id: &str, cache_root: &Path) -> Option<PathBuf> {
    let spec = parse_model_spec(id);
    let entry = cache_path(id, cache_root);
    first_gguf(&snapshot_dirs(&entry), spec.quant.as_deref())
}

/// Snapshot directory named by `revision`: the hash a ref points at, or a snapshot
/// directory of that name.
fn snapshot_for_revision(entry: &Path, revision: &str) -> Option<PathBuf> {
    if let Ok(hash) = fs::read_to_string(entry.join("refs").join(revision)) {
        let snapshot = entry.join("snapshots").join(hash.trim());
        if !hash.trim().is_empty() && snapshot.is_dir() {
            return Some(snapshot);
        }
    }
    let snapshot = entry.join("snapshots").join(revision);
    snapshot.is_dir().then_some(snapshot)
}

/// Complete snapshot directory of `id` under the revision rules.
///
/// An explicit revision is resolved strictly. Without one, `main` is tried first and
/// then every snapshot, which covers caches populated by other tools.
pub fn resolve_snapshot(id: &str, cache_root: &Path, revision: Option<&str>) -> Option<PathBuf> {
    let spec = parse_model_spec(id);
    let entry = cache_path(id, cache_root);
    let complete = |snapshot: &Path| {
        if is_gguf(id) {
            files_under(snapshot).any(|p| is_gguf_match(&p, spec.quant.as_deref()))
        } else {
            has_weights(snapshot)
        }
    };

    if let Some(revision) = revision {
        return snapshot_for_revision(&entry, revision).filter(|s| complete(s.as_path()));
    }
    if let Some(snapshot) = snapshot_for_revision(&entry, "main").filter(|s| complete(s.as_path())) {
        return Some(snapshot);
    }
    snapshot_dirs(&entry)
        .into_iter()
        .find(|s| complete(s.as_path()))
}

/// Whether `id` is fully present in the cache.
pub fn is_cached(id: &str, cache_root: &Path, revision: Option<&str>) -> bool {
    if is_gguf(id) && revision.is_none() {
        return resolve_gguf_file(id, cache_root).is_some();
    }
    resolve_snapshot(id, cache_root, revision).is_some()
}

/// Host path `id` resolves to: the matching `.gguf` file for GGUF ids, the complete
/// snapshot directory otherwise.
pub fn resolve_model_path(id: &str, cache_root: &Path) -> Option<PathBuf> {
    if is_gguf(id) {
        resolve_gguf_file(id, cache_root)
    } else {
        resolve_snapshot(id, cache_root, None)
    }
}

/// The path `id` resolves to as seen from inside a container that mounts
/// `cache_root` at `container_mount`.
pub fn container_path(id: &str, cache_root: &Path, container_mount: &Path) -> Option<PathBuf> {
    let host_path = resolve_model_path(id, cache_root)?;
    let relative = host_path.strip_prefix(cache_root).ok()?;
    Some(container_mount.join(relative))
}
