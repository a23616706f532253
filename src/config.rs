//! Configuration loading
//!
//! A single TOML file with `[identity]`, `[repository]` and `[server]`
//! sections. Every key is optional and falls back to its default.

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VellumConfig {
    pub identity: Identity,
    pub repository: RepositoryConfig,
    pub server: ServerConfig,
}

impl VellumConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

/// Default author and committer of commits made through a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Identity {
    pub fn new(name: Option<String>, email: Option<String>) -> Self {
        Identity { name, email }
    }

    /// `name <email>`, `name`, `<email>`, or nothing when neither is set.
    pub fn committer(&self) -> Option<String> {
        match (&self.name, &self.email) {
            (Some(name), Some(email)) => Some(format!("{name} <{email}>")),
            (Some(name), None) => Some(name.clone()),
            (None, Some(email)) => Some(format!("<{email}>")),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub default_branch: String,
    pub default_encoding: Encoding,
    /// Directory holding the repositories served by the gateway
    pub root: PathBuf,
    pub flavor: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig {
            default_branch: "master".to_string(),
            default_encoding: Encoding::default(),
            root: PathBuf::from("repositories"),
            flavor: "git".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub allow_anonymous_read: bool,
    /// Largest accepted request body, in bytes
    pub max_pack_size: usize,
    /// user -> password for the built-in basic auth policy
    pub credentials: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1:8421".to_string(),
            allow_anonymous_read: false,
            max_pack_size: 64 * 1024 * 1024,
            credentials: BTreeMap::new(),
        }
    }
}

/// Text encoding applied by `read_text`/`write_text`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

impl Encoding {
    pub fn encode(&self, text: &str) -> anyhow::Result<Bytes> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .map_err(|_| anyhow::anyhow!("'{c}' cannot be encoded as latin-1"))
                })
                .collect::<anyhow::Result<Vec<u8>>>()
                .map(Bytes::from),
        }
    }

    pub fn decode(&self, data: &[u8]) -> anyhow::Result<String> {
        match self {
            Encoding::Utf8 => Ok(std::str::from_utf8(data)
                .context("content is not valid utf-8")?
                .to_string()),
            Encoding::Latin1 => Ok(data.iter().map(|&byte| char::from(byte)).collect()),
        }
    }
}
