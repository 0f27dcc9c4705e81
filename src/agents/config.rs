//! Agent configuration loading.
//!
//! An agent is a directory under a project's `agents/` tree:
//!
//! ```text
//! agents/<name>/
//!   description.txt     what the agent does (shown to calling agents)
//!   system_prompt.txt   persona for the LLM
//!   tools.txt           one callable name per line (tools or other agents)
//! ```
//!
//! Directories whose name starts with `_` are skipped; names must match
//! `[A-Za-z0-9_-]+`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AgentConfigError {
    #[error("agent '{0}' not found")]
    NotFound(String),

    #[error("invalid agent name '{0}': only letters, digits, '_' and '-' are allowed")]
    InvalidName(String),

    #[error("agent '{0}' already exists")]
    AlreadyExists(String),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

/// Validate an agent name against the allowed character set.
pub fn validate_agent_name(name: &str) -> Result<(), AgentConfigError> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(AgentConfigError::InvalidName(name.to_string()))
    }
}

// ─── AgentDefinition ─────────────────────────────────────────────────────────

/// Immutable configuration of one agent, loaded from its directory.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    /// Callables this agent may invoke, in file order. Entries may name
    /// tools or other agents.
    pub allowed_callables: Vec<String>,
    #[serde(skip)]
    pub agent_dir: PathBuf,
}

impl AgentDefinition {
    fn load(name: &str, agent_dir: &Path) -> Result<Self, AgentConfigError> {
        let read = |file: &str| -> String {
            fs::read_to_string(agent_dir.join(file))
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };
        let allowed_callables = read("tools.txt")
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self {
            name: name.to_string(),
            description: read("description.txt"),
            system_prompt: read("system_prompt.txt"),
            allowed_callables,
            agent_dir: agent_dir.to_path_buf(),
        })
    }

    /// Path of the whitelist file, used in security error messages.
    pub fn tools_file(&self) -> PathBuf {
        self.agent_dir.join("tools.txt")
    }
}

// ─── AgentRegistry ───────────────────────────────────────────────────────────

/// All agent definitions of one project, loaded once from its `agents/`
/// directory.
pub struct AgentRegistry {
    agents_dir: PathBuf,
    agents: HashMap<String, AgentDefinition>,
}

impl AgentRegistry {
    /// Load every agent under `agents_dir`. A missing directory yields an
    /// empty registry; individually broken agents are skipped with a log
    /// line rather than failing the whole load.
    pub fn load(agents_dir: impl Into<PathBuf>) -> Self {
        let agents_dir = agents_dir.into();
        let mut agents = HashMap::new();

        let entries = match fs::read_dir(&agents_dir) {
            Ok(entries) => entries,
            Err(_) => {
                return Self { agents_dir, agents };
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('_') {
                continue;
            }
            if validate_agent_name(name).is_err() {
                log::warn!("agents: skipping '{name}': invalid name");
                continue;
            }
            match AgentDefinition::load(name, &path) {
                Ok(def) => {
                    agents.insert(name.to_string(), def);
                }
                Err(e) => log::warn!("agents: failed to load '{name}': {e}"),
            }
        }

        Self { agents_dir, agents }
    }

    pub fn has_agent(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }

    /// Agent names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<&AgentDefinition> {
        let mut defs: Vec<&AgentDefinition> = self.agents.values().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Write an agent's three files. Fails if the agent already exists.
    pub fn create_agent(
        &self,
        name: &str,
        description: &str,
        system_prompt: &str,
        allowed_callables: &[String],
    ) -> Result<(), AgentConfigError> {
        validate_agent_name(name)?;
        let dir = self.agents_dir.join(name);
        if dir.exists() {
            return Err(AgentConfigError::AlreadyExists(name.to_string()));
        }
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("description.txt"), description)?;
        fs::write(dir.join("system_prompt.txt"), system_prompt)?;
        fs::write(dir.join("tools.txt"), allowed_callables.join("\n"))?;
        Ok(())
    }

    /// Remove an agent's directory.
    pub fn delete_agent(&self, name: &str) -> Result<(), AgentConfigError> {
        validate_agent_name(name)?;
        let dir = self.agents_dir.join(name);
        if !dir.exists() {
            return Err(AgentConfigError::NotFound(name.to_string()));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }
}
