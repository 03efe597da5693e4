//! Plugin discovery.
//!
//! A plugins directory holds packed plugins (`.ez` files: a bincode-encoded
//! manifest) and exploded trees (a directory with a `plugin.toml`). Each
//! yields name, version, description and the dependencies the host does not
//! already provide. The enabled-plugins file is a TOML list of names.
//! Dependency resolution is a DAG closure, walked in either direction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Ez,
    Dir,
}

#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Dependencies the host does not already provide.
    pub dependencies: Vec<String>,
    pub location: PathBuf,
    pub kind: PluginKind,
}

/// Scan `dir` for plugins. `provided` names applications the host itself
/// ships, which are filtered out of every dependency list.
pub fn discover(dir: impl AsRef<Path>, provided: &[String]) -> Result<Vec<PluginInfo>> {
    let mut found = Vec::new();
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let parsed = if path.extension().is_some_and(|e| e == "ez") {
            read_ez(&path).map(|m| (m, PluginKind::Ez))
        } else if path.is_dir() && path.join("plugin.toml").is_file() {
            read_dir_manifest(&path).map(|m| (m, PluginKind::Dir))
        } else {
            continue;
        };
        match parsed {
            Ok((manifest, kind)) => {
                let dependencies = manifest
                    .dependencies
                    .into_iter()
                    .filter(|d| !provided.contains(d))
                    .collect();
                found.push(PluginInfo {
                    name: manifest.name,
                    version: manifest.version,
                    description: manifest.description,
                    dependencies,
                    location: path,
                    kind,
                });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "unreadable plugin"),
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(found)
}

fn read_ez(path: &Path) -> Result<PluginManifest> {
    let raw = std::fs::read(path)?;
    Ok(bincode::deserialize(&raw)?)
}

fn read_dir_manifest(path: &Path) -> Result<PluginManifest> {
    let raw = std::fs::read_to_string(path.join("plugin.toml"))?;
    toml::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
}

/// Pack a manifest into an `.ez` file. The packaging half of `read_ez`.
pub fn pack_ez(manifest: &PluginManifest, path: &Path) -> Result<()> {
    std::fs::write(path, bincode::serialize(manifest)?)?;
    Ok(())
}

/// Parse the enabled-plugins file: a TOML list of plugin names.
pub fn read_enabled(path: impl AsRef<Path>) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct Enabled {
        enabled: Vec<String>,
    }
    let raw = std::fs::read_to_string(path)?;
    let parsed: Enabled = toml::from_str(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(parsed.enabled)
}

/// Direction of a dependency closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// Everything the roots depend on, transitively.
    Reachable,
    /// Everything that depends on the roots, transitively.
    Reaching,
}

/// Transitive closure over the discovered plugins' dependency DAG.
pub fn dependency_closure(
    plugins: &[PluginInfo],
    roots: &[String],
    direction: Closure,
) -> Vec<String> {
    let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
    for p in plugins {
        for d in &p.dependencies {
            match direction {
                Closure::Reachable => edges.entry(&p.name).or_default().push(d),
                Closure::Reaching => edges.entry(d).or_default().push(&p.name),
            }
        }
    }
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for root in roots {
        if seen.insert(root.as_str()) {
            queue.push_back(root.as_str());
        }
    }
    let mut out = Vec::new();
    while let Some(name) = queue.pop_front() {
        out.push(name.to_string());
        if let Some(nexts) = edges.get(name) {
            for &next in nexts {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    out
}
