//! Workspace-rooted file tools.
//!
//! All paths are resolved relative to the workspace directory handed to each
//! tool at construction; absolute paths and `..` components are rejected so
//! an agent cannot reach outside its workspace.

use std::{
    fs,
    path::{Component, Path, PathBuf},
};

use serde_json::{Value, json};

use super::Tool;

/// Resolve `relative` inside `root`, rejecting escapes.
fn resolve(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(format!("absolute paths are not allowed: '{relative}'"));
    }
    for component in candidate.components() {
        if matches!(component, Component::ParentDir) {
            return Err(format!("path may not contain '..': '{relative}'"));
        }
    }
    Ok(root.join(candidate))
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing '{key}' parameter"))
}

// ─── FileReadTool ────────────────────────────────────────────────────────────

pub struct FileReadTool {
    root: PathBuf,
}

impl FileReadTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the workspace. Use max_lines to limit output for large files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root." },
                "max_lines": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default: all).",
                    "minimum": 1
                }
            },
            "required": ["path"]
        })
    }

    fn execute(&self, params: Value) -> Result<String, String> {
        let path = resolve(&self.root, required_str(&params, "path")?)?;
        let max_lines = params.get("max_lines").and_then(Value::as_u64).map(|n| n as usize);

        let contents = fs::read_to_string(&path)
            .map_err(|e| format!("failed to read '{}': {e}", path.display()))?;

        Ok(match max_lines {
            Some(n) => contents.lines().take(n).collect::<Vec<_>>().join("\n"),
            None => contents,
        })
    }
}

// ─── FileWriteTool ───────────────────────────────────────────────────────────

pub struct FileWriteTool {
    root: PathBuf,
}

impl FileWriteTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating parent directories as needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Path relative to the workspace root." },
                "content": { "type": "string", "description": "Content to write." }
            },
            "required": ["path", "content"]
        })
    }

    fn execute(&self, params: Value) -> Result<String, String> {
        let path = resolve(&self.root, required_str(&params, "path")?)?;
        let content = required_str(&params, "content")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create '{}': {e}", parent.display()))?;
        }
        fs::write(&path, content)
            .map_err(|e| format!("failed to write '{}': {e}", path.display()))?;

        Ok(format!("Wrote {} byte(s) to '{}'", content.len(), path.display()))
    }
}

// ─── FileListTool ────────────────────────────────────────────────────────────

pub struct FileListTool {
    root: PathBuf,
}

impl FileListTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Tool for FileListTool {
    fn name(&self) -> &str {
        "file_list"
    }

    fn description(&self) -> &str {
        "List files and directories at a path in the workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root (default: workspace root)."
                }
            },
            "required": []
        })
    }

    fn execute(&self, params: Value) -> Result<String, String> {
        let relative = params.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = resolve(&self.root, relative)?;

        let mut entries: Vec<String> = fs::read_dir(&path)
            .map_err(|e| format!("failed to list '{}': {e}", path.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                match entry.file_type() {
                    Ok(t) if t.is_dir() => format!("{name}/"),
                    _ => name,
                }
            })
            .collect();
        entries.sort();

        if entries.is_empty() {
            Ok("(empty)".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let write = FileWriteTool::new(dir.path());
        let read = FileReadTool::new(dir.path());

        write
            .execute(json!({"path": "notes/a.txt", "content": "hello"}))
            .unwrap();
        let out = read.execute(json!({"path": "notes/a.txt"})).unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn read_respects_max_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), "1\n2\n3\n4").unwrap();
        let read = FileReadTool::new(dir.path());
        let out = read.execute(json!({"path": "f.txt", "max_lines": 2})).unwrap();
        assert_eq!(out, "1\n2");
    }

    #[test]
    fn parent_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let read = FileReadTool::new(dir.path());
        let err = read.execute(json!({"path": "../outside.txt"})).unwrap_err();
        assert!(err.contains(".."));
    }

    #[test]
    fn absolute_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let read = FileReadTool::new(dir.path());
        assert!(read.execute(json!({"path": "/etc/hostname"})).is_err());
    }

    #[test]
    fn list_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("file.txt"), "x").unwrap();
        let list = FileListTool::new(dir.path());
        let out = list.execute(json!({})).unwrap();
        assert_eq!(out, "file.txt\nsub/");
    }

    #[test]
    fn list_missing_directory_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let list = FileListTool::new(dir.path());
        assert!(list.execute(json!({"path": "nope"})).is_err());
    }
}
