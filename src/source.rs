use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::config::ProgramConfig;

/// Where the code of a run comes from: inline text or a named program
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceRef {
    Code(String),
    Program(String),
}

/// Named programs that clients can run by id
#[derive(Debug, Default)]
pub struct SourceCatalog {
    programs: HashMap<String, PathBuf>,
}

impl SourceCatalog {
    pub fn new(programs: &[ProgramConfig]) -> Self {
        Self {
            programs: programs
                .iter()
                .map(|p| (p.id.clone(), p.path.clone()))
                .collect(),
        }
    }

    /// Whether `source` can be resolved without touching the filesystem
    pub fn knows(&self, source: &SourceRef) -> bool {
        match source {
            SourceRef::Code(_) => true,
            SourceRef::Program(id) => self.programs.contains_key(id),
        }
    }

    pub async fn resolve(&self, source: &SourceRef) -> Result<String> {
        match source {
            SourceRef::Code(code) => Ok(code.clone()),
            SourceRef::Program(id) => {
                let path = self
                    .programs
                    .get(id)
                    .ok_or_else(|| anyhow!("unknown program `{id}`"))?;
                tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("unable to read program `{id}` at {}", path.display()))
            }
        }
    }
}
