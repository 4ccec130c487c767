use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use color_eyre::eyre::{bail, Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;

const DEFAULT_MAX_CONNS: usize = 10;

fn default_max_conns() -> usize {
    DEFAULT_MAX_CONNS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Absolute directory that holds the snapshots and the published
    /// symlinks.
    pub dir: PathBuf,

    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    #[serde(default)]
    pub mirrors: HashMap<String, MirrorConfig>,
}

impl Config {
    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = read_to_string(path).await?;
        Ok(serde_yaml::from_str(&config_str)?)
    }

    pub fn check(&self) -> Result<()> {
        if !self.dir.is_absolute() {
            bail!("dir must be an absolute path");
        }
        if self.max_conns == 0 {
            bail!("max_conns must be positive");
        }
        for (id, mc) in &self.mirrors {
            mc.check().map_err(|e| e.wrap_err(id.clone()))?;
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Base URL of the upstream archive.
    pub url: String,

    /// Suites to mirror. A trailing slash marks a flat repository
    /// ("./" for the archive root).
    pub suites: Vec<String>,

    #[serde(default)]
    pub sections: Vec<String>,

    #[serde(default)]
    pub architectures: Vec<String>,

    /// Whether source packages are mirrored too.
    #[serde(default)]
    pub source: bool,
}

impl MirrorConfig {
    pub fn check(&self) -> Result<()> {
        let url = Url::parse(&self.url).wrap_err_with(|| self.url.clone())?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("unsupported URL scheme: {}", self.url);
        }

        if self.suites.is_empty() {
            bail!("no suites");
        }
        let flat_count = self.suites.iter().filter(|s| is_flat(s)).count();
        if flat_count > 0 {
            if flat_count != self.suites.len() {
                bail!("flat and non-flat suites cannot be mixed");
            }
            if !self.sections.is_empty() || !self.architectures.is_empty() {
                bail!("flat repositories cannot have sections or architectures");
            }
        } else {
            if self.sections.is_empty() {
                bail!("no sections");
            }
            if self.architectures.is_empty() {
                bail!("no architectures");
            }
        }
        Ok(())
    }

    pub fn is_flat(&self) -> bool {
        self.suites.iter().any(|s| is_flat(s))
    }

    /// Resolves an archive-relative path against the base URL.
    pub fn resolve(&self, p: &str) -> Result<Url> {
        let base = if self.url.ends_with('/') {
            self.url.clone()
        } else {
            format!("{}/", self.url)
        };
        Ok(Url::parse(&base)?.join(p.trim_start_matches('/'))?)
    }

    /// The Release/InRelease/Release.gpg paths of one suite.
    pub fn release_files(&self, suite: &str) -> Vec<String> {
        let prefix = if is_flat(suite) {
            let trimmed = suite.trim_matches('/');
            if trimmed == "." {
                String::new()
            } else {
                trimmed.to_string()
            }
        } else {
            format!("dists/{}", suite.trim_matches('/'))
        };

        ["Release", "InRelease", "Release.gpg"]
            .into_iter()
            .map(|name| {
                if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                }
            })
            .collect()
    }

    /// Whether the index at `p` belongs to the configured sections,
    /// architectures and source setting.
    pub fn matching_index(&self, p: &str) -> bool {
        if self.is_flat() {
            return true;
        }

        if !self.sections.iter().any(|s| p.contains(&format!("/{s}/"))) {
            return false;
        }

        let binary = self.architectures.iter().any(|a| {
            p.contains(&format!("/binary-{a}/")) || p.contains(&format!("Contents-{a}"))
        });
        binary || (self.source && p.contains("/source/")) || p.contains("/i18n/")
    }
}

fn is_flat(suite: &str) -> bool {
    suite == "." || suite.ends_with('/')
}
