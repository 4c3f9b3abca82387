use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Known crawler user agents whose requests are logged but never counted.
///
/// Matching is exact: one full user-agent string per line in the list file.
#[derive(Debug, Default, Clone)]
pub struct BotList {
    agents: HashSet<String>,
}

impl BotList {
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agents: agents
                .into_iter()
                .map(Into::into)
                .filter(|a: &String| !a.trim().is_empty())
                .collect(),
        }
    }

    /// Load the list from `path`. A missing file is not fatal: every request
    /// is then treated as human.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                bots_path = %path.display(),
                "Bot list not found. All user agents will be counted."
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("on read bot list {}", path.display()))?;
        let list = Self::new(raw.lines().map(str::trim_end));
        info!(count = list.len(), "Bot list loaded");
        Ok(list)
    }

    pub fn is_bot(&self, user_agent: &str) -> bool {
        self.agents.contains(user_agent)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
