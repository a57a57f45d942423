//! Tool abstraction and the registry that validates calls at the boundary.
//!
//! The [`Tool`] trait is the tool boundary: a pure function of
//! `(arguments, workspace root)` that yields a result string or a typed
//! [`ToolError`]. Tools declare a [`Capability`] and an optional resource
//! key so the engine can decide which calls may overlap.
//!
//! [`ToolRegistry`] maps tool names to implementations and turns the loose
//! JSON the model produces into a [`ValidatedCall`]. Unknown tools and
//! arguments that fail schema validation are rejected with
//! [`ToolError::PolicyViolation`]; nothing is coerced.

use crate::tools::builtin::{EditFile, ListFiles, ReadFile, RunCommand, WriteFile};
use crate::tools::engine::ToolsConfig;
use crate::tools::policy::CommandPolicy;
use crate::{ToolCall, ToolDef, ToolError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Argument key a model may add to any call to order it after another call
/// of the same turn. Stripped before schema validation.
pub const DEPENDS_ON_KEY: &str = "depends_on";

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

// ── Capability ─────────────────────────────────────────────────────

/// Whether a tool changes workspace state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadOnly,
    Mutating,
}

impl Capability {
    pub fn is_mutating(self) -> bool {
        self == Capability::Mutating
    }
}

/// Which default timeout applies to a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    ReadOnly,
    Mutating,
    /// External processes.
    Command,
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool the model can invoke via function-calling.
///
/// `execute` receives arguments that already passed schema validation,
/// with any `depends_on` annotation removed.
///
/// ```ignore
/// struct Echo;
///
/// impl Tool for Echo {
///     fn definition(&self) -> ToolDef {
///         ToolDef::new("echo", "Echo the text back", json_schema_for::<EchoArgs>())
///     }
///
///     fn capability(&self) -> Capability {
///         Capability::ReadOnly
///     }
///
///     fn execute<'a>(&'a self, args: Value, _workspace: &'a Path) -> ToolFuture<'a> {
///         Box::pin(async move {
///             let args: EchoArgs = parse_args(args)?;
///             Ok(args.text)
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The definition sent to the model.
    fn definition(&self) -> ToolDef;

    fn name(&self) -> String {
        self.definition().function.name
    }

    /// Implementation version, bumped when behavior changes incompatibly.
    fn version(&self) -> u32 {
        1
    }

    /// Defaults to [`Capability::Mutating`] so an undeclared tool is
    /// scheduled conservatively.
    fn capability(&self) -> Capability {
        Capability::Mutating
    }

    fn timeout_class(&self) -> TimeoutClass {
        match self.capability() {
            Capability::ReadOnly => TimeoutClass::ReadOnly,
            Capability::Mutating => TimeoutClass::Mutating,
        }
    }

    /// The resource this call touches, such as a normalized file path.
    ///
    /// `None` on a mutating tool means the call may touch anything in the
    /// workspace and is ordered against every other call of its turn.
    fn resource_key(&self, args: &Value) -> Option<String> {
        let _ = args;
        None
    }

    /// Identity used to count consecutive failures of "the same" call.
    fn call_site(&self, args: &Value) -> String {
        call_site(&self.name(), self.resource_key(args).as_deref())
    }

    /// Run the tool. Uses a boxed future so the trait stays dyn-compatible.
    fn execute<'a>(&'a self, args: Value, workspace: &'a Path) -> ToolFuture<'a>;
}

// ── ValidatedCall ──────────────────────────────────────────────────

/// A tool call that passed boundary validation.
#[derive(Clone)]
pub struct ValidatedCall {
    pub call: ToolCall,
    pub tool: Arc<dyn Tool>,
    /// Parsed arguments, without `depends_on`.
    pub args: Value,
    pub depends_on: Option<String>,
    pub capability: Capability,
    pub resource_key: Option<String>,
    pub call_site: String,
}

impl fmt::Debug for ValidatedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedCall")
            .field("id", &self.call.id)
            .field("tool", &self.call.name())
            .field("capability", &self.capability)
            .field("resource_key", &self.resource_key)
            .field("depends_on", &self.depends_on)
            .field("call_site", &self.call_site)
            .finish()
    }
}

/// `tool` or `tool@resource`.
pub fn call_site(tool: &str, resource_key: Option<&str>) -> String {
    match resource_key {
        Some(key) => format!("{tool}@{key}"),
        None => tool.to_string(),
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────

/// Named tool implementations, dispatched by name.
///
/// ```ignore
/// let registry = ToolRegistry::new()
///     .with_builtin_tools(&config.tools)
///     .with_if(enable_search, SearchTool::new());
/// let defs = registry.definitions();
/// ```
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name();
        if self.tools.contains_key(&name) {
            debug!("Replacing registered tool '{name}'");
        }
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// Register `read_file`, `write_file`, `edit_file`, `list_files` and
    /// `run_command`. The command tool uses the configured allow-list.
    pub fn with_builtin_tools(self, config: &ToolsConfig) -> Self {
        let max = config.max_result_bytes;
        self.with(ReadFile::new().max_result_bytes(max))
            .with(WriteFile)
            .with(EditFile)
            .with(ListFiles)
            .with(
                RunCommand::new(CommandPolicy::new(config.allowed_commands.iter().cloned()))
                    .max_result_bytes(max),
            )
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Definitions for the model API, sorted by name so the request prefix
    /// is stable across turns. Each schema advertises the optional
    /// `depends_on` argument.
    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools
            .values()
            .map(|t| with_depends_on(t.definition()))
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate a raw call against the registry.
    pub fn validate(&self, call: &ToolCall) -> Result<ValidatedCall, ToolError> {
        let name = call.name();
        let tool = self.tools.get(name).ok_or_else(|| {
            ToolError::policy(format!(
                "unknown tool '{name}'. Available tools: {}",
                self.names().join(", ")
            ))
        })?;

        let mut args = parse_arguments(name, &call.function.arguments)?;
        let depends_on = match args.as_object_mut().and_then(|o| o.remove(DEPENDS_ON_KEY)) {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(other) => {
                return Err(ToolError::policy(format!(
                    "'{DEPENDS_ON_KEY}' must be a call id string, got {other}"
                )));
            }
        };

        validate_tool_arguments(tool.as_ref(), &args)?;

        Ok(ValidatedCall {
            call: call.clone(),
            capability: tool.capability(),
            resource_key: tool.resource_key(&args),
            call_site: tool.call_site(&args),
            tool: Arc::clone(tool),
            args,
            depends_on,
        })
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn with_depends_on(mut def: ToolDef) -> ToolDef {
    if let Some(properties) = def
        .function
        .parameters
        .get_mut("properties")
        .and_then(Value::as_object_mut)
    {
        properties.insert(
            DEPENDS_ON_KEY.to_string(),
            serde_json::json!({
                "type": "string",
                "description": "Id of another tool call in this response that must finish before this one starts."
            }),
        );
    }
    def
}

/// Parse the raw argument string of a call into a JSON object. An empty
/// string is treated as `{}`.
fn parse_arguments(tool: &str, raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        ToolError::policy(format!(
            "invalid JSON arguments for tool '{tool}': {e}. \
             Provide a JSON object matching the tool's parameter schema."
        ))
    })?;
    if !value.is_object() {
        return Err(ToolError::policy(format!(
            "arguments for tool '{tool}' must be a JSON object"
        )));
    }
    Ok(value)
}

/// Validate arguments against the tool's declared JSON Schema.
pub fn validate_tool_arguments(tool: &dyn Tool, args: &Value) -> Result<(), ToolError> {
    let def = tool.definition();
    let validator = match jsonschema::validator_for(&def.function.parameters) {
        Ok(v) => v,
        Err(e) => {
            warn!(
                "Tool '{}' declares an invalid schema, skipping validation: {e}",
                def.function.name
            );
            return Ok(());
        }
    };

    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::policy(format!(
            "argument validation failed for tool '{}':\n{}",
            def.function.name,
            errors.join("\n")
        )))
    }
}

/// Deserialize validated arguments into a typed struct.
pub fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::policy(format!("invalid arguments: {e}")))
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

/// Truncate a string to at most `max` bytes on a char boundary, appending a
/// notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let kept = s.get(..cut).unwrap_or_default();
    format!("{kept}...\n[truncated: {} bytes total]", s.len())
}
