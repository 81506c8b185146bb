//! Shell scripts run on hosts.
//!
//! Each script is an embedded bash template with a fixed set of parameters. `Script`
//! carries those parameters typed; they are shell-quoted and substituted only when the
//! script is rendered for the executor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;

use crate::cache::{is_gguf, parse_model_spec};
use crate::error::Result;

const IMAGE_SYNC: &str = include_str!("scripts/image_sync.sh");
const MODEL_SYNC: &str = include_str!("scripts/model_sync.sh");
const MODEL_SYNC_GGUF: &str = include_str!("scripts/model_sync_gguf.sh");
const MODEL_DISTRIBUTE: &str = include_str!("scripts/model_distribute.sh");
const IMAGE_DISTRIBUTE: &str = include_str!("scripts/image_distribute.sh");
const IMAGE_SAVE: &str = include_str!("scripts/image_save.sh");
const IMAGE_LOAD: &str = include_str!("scripts/image_load.sh");
const FIX_OWNERSHIP: &str = include_str!("scripts/fix_ownership.sh");
const CHOWN_CACHE: &str = include_str!("scripts/chown_cache.sh");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Pull a container image unless present.
    PullImage { image: String },
    /// Fetch a whole model repository into the hub cache under `cache`.
    FetchModel {
        model_id: String,
        cache: PathBuf,
        revision: Option<String>,
    },
    /// Fetch only the GGUF files matching `quant` (any `.gguf` when `None`).
    FetchGguf {
        repo_id: String,
        quant: Option<String>,
        cache: PathBuf,
        revision: Option<String>,
    },
    /// Run on the head: rsync `source` to the same path on every target.
    DistributeModel {
        source: PathBuf,
        targets: Vec<String>,
        ssh_opts: String,
        ssh_user: Option<String>,
    },
    /// Run on the head: stream `image` to every target.
    DistributeImage {
        image: String,
        targets: Vec<String>,
        ssh_opts: String,
        ssh_user: Option<String>,
    },
    /// Pull `image` if needed and save it to `archive`.
    SaveImage { image: String, archive: PathBuf },
    /// Load `archive` unless `image` is already present.
    LoadImage { image: String, archive: PathBuf },
    /// Best-effort chown of `cache_dir` to the SSH user.
    FixOwnership { cache_dir: PathBuf },
    /// Hand `cache_dir` to the sudo-invoking user. Must run as root.
    ChownCache { cache_dir: PathBuf },
}

impl Script {
    /// The fetch script suited to `model_id`: GGUF-only downloads for GGUF ids, a full
    /// repository fetch otherwise.
    pub fn fetch_model(model_id: &str, cache: &Path, revision: Option<&str>) -> Self {
        let revision = revision.map(str::to_owned);
        if is_gguf(model_id) {
            let spec = parse_model_spec(model_id);
            Script::FetchGguf {
                repo_id: spec.repo_id,
                quant: spec.quant,
                cache: cache.to_path_buf(),
                revision,
            }
        } else {
            Script::FetchModel {
                model_id: model_id.to_owned(),
                cache: cache.to_path_buf(),
                revision,
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Script::PullImage { .. } => "image_sync.sh",
            Script::FetchModel { .. } => "model_sync.sh",
            Script::FetchGguf { .. } => "model_sync_gguf.sh",
            Script::DistributeModel { .. } => "model_distribute.sh",
            Script::DistributeImage { .. } => "image_distribute.sh",
            Script::SaveImage { .. } => "image_save.sh",
            Script::LoadImage { .. } => "image_load.sh",
            Script::FixOwnership { .. } => "fix_ownership.sh",
            Script::ChownCache { .. } => "chown_cache.sh",
        }
    }

    fn template(&self) -> &'static str {
        match self {
            Script::PullImage { .. } => IMAGE_SYNC,
            Script::FetchModel { .. } => MODEL_SYNC,
            Script::FetchGguf { .. } => MODEL_SYNC_GGUF,
            Script::DistributeModel { .. } => MODEL_DISTRIBUTE,
            Script::DistributeImage { .. } => IMAGE_DISTRIBUTE,
            Script::SaveImage { .. } => IMAGE_SAVE,
            Script::LoadImage { .. } => IMAGE_LOAD,
            Script::FixOwnership { .. } => FIX_OWNERSHIP,
            Script::ChownCache { .. } => CHOWN_CACHE,
        }
    }

    /// Template parameters, already shell-quoted.
    fn params(&self) -> BTreeMap<&'static str, String> {
        let mut params = BTreeMap::new();
        match self {
            Script::PullImage { image } => {
                params.insert("image", shell_quote(image));
            }
            Script::FetchModel {
                model_id,
                cache,
                revision,
            } => {
                params.insert("model_id", shell_quote(model_id));
                params.insert("cache", quote_path(cache));
                params.insert("revision_flag", revision_flag(revision.as_deref()));
            }
            Script::FetchGguf {
                repo_id,
                quant,
                cache,
                revision,
            } => {
                params.insert("repo_id", shell_quote(repo_id));
                params.insert("quant", shell_quote(quant.as_deref().unwrap_or("")));
                params.insert("cache", quote_path(cache));
                params.insert("revision_flag", revision_flag(revision.as_deref()));
            }
            Script::DistributeModel {
                source,
                targets,
                ssh_opts,
                ssh_user,
            } => {
                params.insert("source", quote_path(source));
                params.insert("targets", join_quoted(targets));
                params.insert("ssh_opts", shell_quote(ssh_opts));
                params.insert("ssh_user", shell_quote(ssh_user.as_deref().unwrap_or("")));
            }
            Script::DistributeImage {
                image,
                targets,
                ssh_opts,
                ssh_user,
            } => {
                params.insert("image", shell_quote(image));
                params.insert("targets", join_quoted(targets));
                params.insert("ssh_opts", shell_quote(ssh_opts));
                params.insert("ssh_user", shell_quote(ssh_user.as_deref().unwrap_or("")));
            }
            Script::SaveImage { image, archive } | Script::LoadImage { image, archive } => {
                params.insert("image", shell_quote(image));
                params.insert("archive", quote_path(archive));
            }
            Script::FixOwnership { cache_dir } | Script::ChownCache { cache_dir } => {
                params.insert("cache_dir", quote_path(cache_dir));
            }
        }
        params
    }

    /// Renders the script text handed to the executor.
    pub fn render(&self) -> Result<String> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        Ok(registry.render_template(self.template(), &self.params())?)
    }
}

/// `--revision <rev> ` when a revision is given, nothing otherwise.
fn revision_flag(revision: Option<&str>) -> String {
    match revision {
        Some(revision) => format!("--revision {} ", shell_quote(revision)),
        None => String::new(),
    }
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

fn join_quoted(words: &[String]) -> String {
    words
        .iter()
        .map(|word| shell_quote(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quotes `s` for a POSIX shell. Words made only of safe characters pass through.
pub fn shell_quote(s: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c);
    if !s.is_empty() && s.chars().all(safe) {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
