use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub const DEFAULT_TOKENS_FILE: &str = "~tokens.json";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
}

/// Tokens granted through `auth.finish`, keyed by the space-joined scope string.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
pub struct TokenStore {
    #[serde(default)]
    pub tokens: BTreeMap<String, Token>,
}

impl TokenStore {
    /// Never fails: a missing, empty or unreadable file yields an empty store.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                log::warn!("ignoring unreadable token store {}: {}", path.display(), err);
                return Self::default();
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Self::default();
        }
        match serde_json::from_slice(&raw) {
            Ok(store) => store,
            Err(err) => {
                log::warn!("ignoring corrupt token store {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    /// Replaces the file wholesale via a temp file renamed over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir).context("create temp token file")?;
        let raw = serde_json::to_vec_pretty(self).context("encode tokens")?;
        file.write_all(&raw).context("write tokens")?;
        file.persist(path)
            .with_context(|| format!("save tokens to {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, scope: &str) -> Option<&Token> {
        self.tokens.get(scope)
    }

    pub fn insert(&mut self, scope: String, token: Token) {
        self.tokens.insert(scope, token);
    }

    pub fn remove(&mut self, scope: &str) -> Option<Token> {
        self.tokens.remove(scope)
    }
}
