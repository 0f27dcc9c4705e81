//! Project directory management.
//!
//! Each project is a directory under the user root:
//!
//! ```text
//! user/<project_dir>/
//!   agents/<name>/{description.txt, system_prompt.txt, tools.txt}
//!   tools/      (optional; falls back to default/)
//!   prompts/    (optional; falls back to default/)
//! ```
//!
//! `agents/` never falls back to the default project; `tools/` and
//! `prompts/` do.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::store::models::ProjectRecord;
use crate::store::{ExecutionStore, Result, StoreError};

/// Maximum length of a generated project directory slug.
const MAX_SLUG_LEN: usize = 50;

/// Generate a filesystem-safe directory name from a project display name.
///
/// Lowercase, spaces become underscores, everything outside `[a-z0-9_-]` is
/// dropped, truncated to 50 chars, and collisions get a `_2`, `_3`, … suffix.
pub fn generate_safe_dirname(name: &str, existing: &[String]) -> String {
    let mut safe: String = name
        .to_lowercase()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    safe.truncate(MAX_SLUG_LEN);
    let safe = safe.trim_end_matches(['_', '-']).to_string();
    let base = if safe.is_empty() { "project".to_string() } else { safe };

    if !existing.iter().any(|e| e == &base) {
        return base;
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{base}_{counter}");
        if !existing.iter().any(|e| e == &candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Manages the multi-project directory structure and its store rows.
pub struct ProjectManager {
    user_dir: PathBuf,
    store: Arc<ExecutionStore>,
}

impl ProjectManager {
    pub fn new(user_dir: impl Into<PathBuf>, store: Arc<ExecutionStore>) -> Self {
        Self {
            user_dir: user_dir.into(),
            store,
        }
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    /// Ensure the `default` project directory and its `agents/` subdirectory
    /// exist, creating them if needed.
    pub fn ensure_default_layout(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.user_dir.join("default").join("agents"))
    }

    pub fn project_base_dir(&self, project_dir: &str) -> PathBuf {
        self.user_dir.join(project_dir)
    }

    /// Agents directory for a project. No fallback: each project owns its
    /// agents.
    pub fn agents_dir(&self, project_dir: &str) -> PathBuf {
        self.project_base_dir(project_dir).join("agents")
    }

    /// Tools directory, falling back to the default project's when the
    /// project has none.
    pub fn tools_dir(&self, project_dir: &str) -> PathBuf {
        let own = self.project_base_dir(project_dir).join("tools");
        if own.exists() {
            own
        } else {
            self.user_dir.join("default").join("tools")
        }
    }

    /// Prompts directory, falling back to the default project's when the
    /// project has none.
    pub fn prompts_dir(&self, project_dir: &str) -> PathBuf {
        let own = self.project_base_dir(project_dir).join("prompts");
        if own.exists() {
            own
        } else {
            self.user_dir.join("default").join("prompts")
        }
    }

    /// Create a project: store row plus directory skeleton.
    pub fn create_project(
        &self,
        name: &str,
        create_tools: bool,
        create_prompts: bool,
    ) -> Result<ProjectRecord> {
        let existing: Vec<String> = self
            .store
            .projects()?
            .into_iter()
            .map(|p| p.project_dir)
            .collect();
        let project_dir = generate_safe_dirname(name, &existing);

        let record = self.store.create_project(name, &project_dir)?;

        let base = self.project_base_dir(&project_dir);
        fs::create_dir_all(base.join("agents")).map_err(io_err)?;
        if create_tools {
            fs::create_dir_all(base.join("tools")).map_err(io_err)?;
        }
        if create_prompts {
            fs::create_dir_all(base.join("prompts")).map_err(io_err)?;
        }
        Ok(record)
    }

    /// Clone a project: agents always, tools/prompts optionally.
    pub fn clone_project(
        &self,
        source_dir: &str,
        new_name: &str,
        clone_tools: bool,
        clone_prompts: bool,
    ) -> Result<ProjectRecord> {
        let source = self.project_base_dir(source_dir);
        if !source.exists() {
            return Err(StoreError::NotFound(format!(
                "source project directory '{source_dir}'"
            )));
        }

        let existing: Vec<String> = self
            .store
            .projects()?
            .into_iter()
            .map(|p| p.project_dir)
            .collect();
        let new_dir = generate_safe_dirname(new_name, &existing);

        let record = self.store.create_project(new_name, &new_dir)?;

        let dest = self.project_base_dir(&new_dir);
        fs::create_dir_all(&dest).map_err(io_err)?;

        if source.join("agents").exists() {
            copy_tree(&source.join("agents"), &dest.join("agents")).map_err(io_err)?;
        } else {
            fs::create_dir_all(dest.join("agents")).map_err(io_err)?;
        }
        if clone_tools && source.join("tools").exists() {
            copy_tree(&source.join("tools"), &dest.join("tools")).map_err(io_err)?;
        }
        if clone_prompts && source.join("prompts").exists() {
            copy_tree(&source.join("prompts"), &dest.join("prompts")).map_err(io_err)?;
        }
        Ok(record)
    }

    /// Delete a project: store row, schedules, and directory tree. The
    /// `default` project is refused by the store.
    pub fn delete_project(&self, project_name: &str) -> Result<()> {
        let project = self
            .store
            .project_by_name(project_name)?
            .ok_or_else(|| StoreError::NotFound(format!("project '{project_name}'")))?;

        self.store.delete_project(project_name)?;
        self.store.delete_schedules_for_project(&project.project_dir)?;

        let path = self.project_base_dir(&project.project_dir);
        if path.exists() {
            fs::remove_dir_all(&path).map_err(io_err)?;
        }
        Ok(())
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        self.store.projects()
    }
}

fn io_err(e: std::io::Error) -> StoreError {
    StoreError::InvalidData(format!("filesystem error: {e}"))
}

/// Recursively copy `src` into `dest` (created if absent).
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_manager() -> (tempfile::TempDir, ProjectManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ExecutionStore::in_memory().unwrap());
        let manager = ProjectManager::new(dir.path().join("user"), store);
        manager.ensure_default_layout().unwrap();
        (dir, manager)
    }

    #[test]
    fn safe_dirname_normalizes() {
        assert_eq!(generate_safe_dirname("My Cool Project!", &[]), "my_cool_project");
        assert_eq!(generate_safe_dirname("___", &[]), "project");
        assert_eq!(generate_safe_dirname("trailing__", &[]), "trailing");
    }

    #[test]
    fn safe_dirname_resolves_collisions() {
        let existing = vec!["report".to_string(), "report_2".to_string()];
        assert_eq!(generate_safe_dirname("Report", &existing), "report_3");
    }

    #[test]
    fn safe_dirname_truncates() {
        let long = "x".repeat(120);
        assert!(generate_safe_dirname(&long, &[]).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn create_project_builds_skeleton() {
        let (_tmp, manager) = make_manager();
        let record = manager.create_project("Research Lab", true, false).unwrap();
        assert_eq!(record.project_dir, "research_lab");
        assert!(manager.agents_dir("research_lab").exists());
        assert!(manager.project_base_dir("research_lab").join("tools").exists());
        assert!(!manager.project_base_dir("research_lab").join("prompts").exists());
    }

    #[test]
    fn tools_dir_falls_back_to_default() {
        let (_tmp, manager) = make_manager();
        manager.create_project("Bare", false, false).unwrap();
        assert_eq!(
            manager.tools_dir("bare"),
            manager.user_dir().join("default").join("tools")
        );
    }

    #[test]
    fn agents_dir_never_falls_back() {
        let (_tmp, manager) = make_manager();
        assert_eq!(
            manager.agents_dir("ghost"),
            manager.user_dir().join("ghost").join("agents")
        );
    }

    #[test]
    fn clone_copies_agents_tree() {
        let (_tmp, manager) = make_manager();
        manager.create_project("Source", false, false).unwrap();
        let agent_dir = manager.agents_dir("source").join("helper");
        fs::create_dir_all(&agent_dir).unwrap();
        fs::write(agent_dir.join("description.txt"), "helps out").unwrap();

        let record = manager.clone_project("source", "Copy", false, false).unwrap();
        assert_eq!(record.project_dir, "copy");
        let cloned = manager.agents_dir("copy").join("helper").join("description.txt");
        assert_eq!(fs::read_to_string(cloned).unwrap(), "helps out");
    }

    #[test]
    fn clone_missing_source_fails() {
        let (_tmp, manager) = make_manager();
        assert!(manager.clone_project("nope", "Copy", false, false).is_err());
    }

    #[test]
    fn delete_project_removes_row_and_tree() {
        let (_tmp, manager) = make_manager();
        manager.create_project("Doomed", false, false).unwrap();
        assert!(manager.project_base_dir("doomed").exists());

        manager.delete_project("Doomed").unwrap();
        assert!(!manager.project_base_dir("doomed").exists());
        assert!(manager.list_projects().unwrap().iter().all(|p| p.project_name != "Doomed"));
    }

    #[test]
    fn delete_default_is_refused() {
        let (_tmp, manager) = make_manager();
        assert!(manager.delete_project("default").is_err());
    }
}
