//! Built-in workspace tools.
//!
//! | Tool | Name | Capability | Resource key |
//! |------|------|------------|--------------|
//! | [`ReadFile`] | `read_file` | read-only | `file:<path>` |
//! | [`WriteFile`] | `write_file` | mutating | `file:<path>` |
//! | [`EditFile`] | `edit_file` | mutating | `file:<path>` |
//! | [`ListFiles`] | `list_files` | read-only | `file:<path>` |
//! | [`RunCommand`] | `run_command` | mutating | whole workspace |
//!
//! Paths are relative to the workspace root. Absolute paths and `..`
//! components are rejected with a policy violation.

use crate::tools::core::{
    Capability, DEFAULT_MAX_RESULT_BYTES, TimeoutClass, Tool, ToolFuture, parse_args,
    truncate_result,
};
use crate::tools::policy::CommandPolicy;
use crate::{ToolDef, ToolError, json_schema_for};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::process::Command;

// ── Typed argument structs ──────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    /// File path relative to the workspace root (e.g. 'src/main.rs').
    pub path: String,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
    /// File path relative to the workspace root. Parent directories are created.
    pub path: String,
    /// Full new content of the file.
    pub content: String,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EditFileArgs {
    /// File path relative to the workspace root.
    pub path: String,
    /// Exact text to replace. Must occur exactly once in the file.
    pub old_text: String,
    /// Replacement text.
    pub new_text: String,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListFilesArgs {
    /// Directory relative to the workspace root (default '.').
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RunCommandArgs {
    /// Command line to run in the workspace root, e.g. 'cargo test --lib'.
    /// Runs without a shell: pipes, redirects and '&&' are rejected.
    pub command: String,
}

// ── Paths ───────────────────────────────────────────────────────────

/// Resolve a workspace-relative path, rejecting escapes.
pub fn resolve_path(workspace: &Path, rel: &str) -> Result<PathBuf, ToolError> {
    let rel_path = Path::new(rel);
    let mut clean = PathBuf::new();
    for component in rel_path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(ToolError::policy(format!(
                    "path '{rel}' escapes the workspace ('..' is not allowed)"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ToolError::policy(format!(
                    "path '{rel}' must be relative to the workspace root"
                )));
            }
        }
    }
    Ok(workspace.join(clean))
}

/// Resource key for a workspace path: `file:` plus the normalized relative
/// path, so `./src/a.rs` and `src/a.rs` serialize against each other.
fn path_key(rel: &str) -> String {
    let normalized: Vec<String> = Path::new(rel)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if normalized.is_empty() {
        "file:.".to_string()
    } else {
        format!("file:{}", normalized.join("/"))
    }
}

fn path_arg_key(args: &Value, default: Option<&str>) -> Option<String> {
    args.get("path")
        .and_then(Value::as_str)
        .or(default)
        .map(path_key)
}

// ── ReadFile ────────────────────────────────────────────────────────

pub struct ReadFile {
    max_result_bytes: usize,
}

impl Default for ReadFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadFile {
    pub fn new() -> Self {
        Self {
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    pub fn max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }
}

impl Tool for ReadFile {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "read_file",
            "Read a text file from the workspace. Use list_files to discover paths first.",
            json_schema_for::<ReadFileArgs>(),
        )
    }

    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }

    fn resource_key(&self, args: &Value) -> Option<String> {
        path_arg_key(args, None)
    }

    fn execute<'a>(&'a self, args: Value, workspace: &'a Path) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ReadFileArgs = parse_args(args)?;
            let full_path = resolve_path(workspace, &args.path)?;

            if let Ok(meta) = fs::metadata(&full_path).await
                && meta.is_dir()
            {
                return Err(ToolError::execution(format!(
                    "'{}' is a directory, not a file. Use list_files to browse directories.",
                    args.path
                )));
            }

            let content = fs::read_to_string(&full_path)
                .await
                .map_err(|e| ToolError::from_io(Path::new(&args.path), &e))?;
            Ok(truncate_result(content, self.max_result_bytes))
        })
    }
}

// ── WriteFile ───────────────────────────────────────────────────────

pub struct WriteFile;

impl Tool for WriteFile {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "write_file",
            "Create or overwrite a file in the workspace with the given content. \
             Prefer edit_file for small changes to existing files.",
            json_schema_for::<WriteFileArgs>(),
        )
    }

    fn capability(&self) -> Capability {
        Capability::Mutating
    }

    fn resource_key(&self, args: &Value) -> Option<String> {
        path_arg_key(args, None)
    }

    fn execute<'a>(&'a self, args: Value, workspace: &'a Path) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: WriteFileArgs = parse_args(args)?;
            let full_path = resolve_path(workspace, &args.path)?;
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::from_io(parent, &e))?;
            }
            fs::write(&full_path, args.content.as_bytes())
                .await
                .map_err(|e| ToolError::from_io(Path::new(&args.path), &e))?;
            Ok(format!(
                "Wrote {} bytes to {}",
                args.content.len(),
                args.path
            ))
        })
    }
}

// ── EditFile ────────────────────────────────────────────────────────

pub struct EditFile;

impl Tool for EditFile {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "edit_file",
            "Replace one exact occurrence of old_text with new_text in a workspace file. \
             Fails if old_text is missing or occurs more than once.",
            json_schema_for::<EditFileArgs>(),
        )
    }

    fn capability(&self) -> Capability {
        Capability::Mutating
    }

    fn resource_key(&self, args: &Value) -> Option<String> {
        path_arg_key(args, None)
    }

    fn execute<'a>(&'a self, args: Value, workspace: &'a Path) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: EditFileArgs = parse_args(args)?;
            if args.old_text.is_empty() {
                return Err(ToolError::policy("old_text must not be empty"));
            }
            let full_path = resolve_path(workspace, &args.path)?;
            let content = fs::read_to_string(&full_path)
                .await
                .map_err(|e| ToolError::from_io(Path::new(&args.path), &e))?;

            match content.matches(args.old_text.as_str()).count() {
                0 => Err(ToolError::execution(format!(
                    "old_text not found in {}",
                    args.path
                ))),
                1 => {
                    let updated = content.replacen(&args.old_text, &args.new_text, 1);
                    fs::write(&full_path, updated.as_bytes())
                        .await
                        .map_err(|e| ToolError::from_io(Path::new(&args.path), &e))?;
                    Ok(format!("Edited {}", args.path))
                }
                n => Err(ToolError::execution(format!(
                    "old_text occurs {n} times in {}; include more surrounding context",
                    args.path
                ))),
            }
        })
    }
}

// ── ListFiles ───────────────────────────────────────────────────────

pub struct ListFiles;

impl Tool for ListFiles {
    fn definition(&self) -> ToolDef {
        ToolDef::new(
            "list_files",
            "List the entries of a workspace directory, one per line, sorted by name. \
             Directories end with '/'.",
            json_schema_for::<ListFilesArgs>(),
        )
    }

    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }

    fn resource_key(&self, args: &Value) -> Option<String> {
        path_arg_key(args, Some("."))
    }

    fn execute<'a>(&'a self, args: Value, workspace: &'a Path) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: ListFilesArgs = parse_args(args)?;
            let rel = args.path.as_deref().unwrap_or(".");
            let full_path = resolve_path(workspace, rel)?;

            let mut dir = fs::read_dir(&full_path)
                .await
                .map_err(|e| ToolError::from_io(Path::new(rel), &e))?;
            let mut entries = Vec::new();
            while let Some(entry) = dir
                .next_entry()
                .await
                .map_err(|e| ToolError::from_io(Path::new(rel), &e))?
            {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await.is_ok_and(|ft| ft.is_dir()) {
                    name.push('/');
                }
                entries.push(name);
            }
            entries.sort();
            if entries.is_empty() {
                Ok(format!("{rel} is empty"))
            } else {
                Ok(entries.join("\n"))
            }
        })
    }
}

// ── RunCommand ──────────────────────────────────────────────────────

/// Run an allow-listed program in the workspace root.
///
/// The child is killed if the call is dropped (timeout or abort).
pub struct RunCommand {
    policy: CommandPolicy,
    max_result_bytes: usize,
}

impl RunCommand {
    pub fn new(policy: CommandPolicy) -> Self {
        Self {
            policy,
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
        }
    }

    pub fn max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }
}

impl Tool for RunCommand {
    fn definition(&self) -> ToolDef {
        let allowed: Vec<&str> = self.policy.allowed().collect();
        ToolDef::new(
            "run_command",
            format!(
                "Run a program in the workspace root and return its output. \
                 Allowed programs: {}. No shell: pipes, redirects and '&&' are rejected.",
                allowed.join(", ")
            ),
            json_schema_for::<RunCommandArgs>(),
        )
    }

    fn capability(&self) -> Capability {
        Capability::Mutating
    }

    fn timeout_class(&self) -> TimeoutClass {
        TimeoutClass::Command
    }

    fn call_site(&self, args: &Value) -> String {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        format!(
            "run_command@{}",
            command.split_whitespace().collect::<Vec<_>>().join(" ")
        )
    }

    fn execute<'a>(&'a self, args: Value, workspace: &'a Path) -> ToolFuture<'a> {
        Box::pin(async move {
            let args: RunCommandArgs = parse_args(args)?;
            let argv = self.policy.check(&args.command)?;
            let (program, rest) = argv
                .split_first()
                .ok_or_else(|| ToolError::policy("empty command"))?;

            let output = Command::new(program)
                .args(rest)
                .current_dir(workspace)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        ToolError::not_found(format!("program '{program}'"))
                    }
                    _ => ToolError::execution(format!("failed to run {program}: {e}")),
                })?;

            format_output(output, self.max_result_bytes)
        })
    }
}

/// Successful exits yield stdout (plus stderr if any). Failures carry both
/// streams so the model can read compiler or test output.
fn format_output(output: std::process::Output, max: usize) -> Result<String, ToolError> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status.success() {
        let text = if stderr.trim().is_empty() {
            stdout.into_owned()
        } else {
            format!("{stdout}\n[stderr]\n{stderr}")
        };
        Ok(truncate_result(text, max))
    } else {
        Err(ToolError::execution(truncate_result(
            format!("command failed ({}):\n{stdout}\n{stderr}", output.status),
            max,
        )))
    }
}
