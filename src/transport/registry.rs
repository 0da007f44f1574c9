//! Tool registry: maps public tool names to (backend, original tool name).
//!
//! Public names are `backend_tool` restricted to `[A-Za-z0-9_-]` and at most
//! 64 characters. Longer names keep a prefix and end in `_` plus eight hex
//! characters of a SHA-256 over the (backend, tool) pair. Two pairs that
//! still land on the same public name never merge: the later one is skipped.
//!
//! A registry is built once per discovery pass and then only read.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};

/// Maximum length of a public tool name.
pub const PUBLIC_NAME_MAX_LEN: usize = 64;

/// Joins the encoded backend id and tool name.
pub const NAME_SEPARATOR: char = '_';

/// Hex characters of the disambiguating hash on truncated names.
const HASH_SUFFIX_LEN: usize = 8;

/// Keys accepted for a raw tool's parameter schema.
const SCHEMA_KEYS: [&str; 4] = ["parameters", "inputSchema", "input_schema", "params_schema"];

// ─── Types ───────────────────────────────────────────────────────────────────

/// A discovered tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub backend_id: String,
    pub original_name: String,
    pub description: String,
    pub parameter_schema: serde_json::Value,
}

/// A raw tool entry that was not registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTool {
    pub backend_id: String,
    pub tool_name: String,
    pub reason: String,
}

// ─── Name Encoding ───────────────────────────────────────────────────────────

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn pair_hash(backend_id: &str, original_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(backend_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(original_name.as_bytes());
    hasher
        .finalize()
        .iter()
        .take(HASH_SUFFIX_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Compute the public name for a (backend, tool) pair.
pub fn encode_public_name(backend_id: &str, original_name: &str) -> String {
    let full = format!(
        "{}{NAME_SEPARATOR}{}",
        sanitize(backend_id),
        sanitize(original_name)
    );
    if full.len() <= PUBLIC_NAME_MAX_LEN {
        return full;
    }

    // Sanitized names are ASCII, so byte slicing is safe.
    let keep = PUBLIC_NAME_MAX_LEN - HASH_SUFFIX_LEN - 1;
    format!(
        "{}{NAME_SEPARATOR}{}",
        &full[..keep],
        pair_hash(backend_id, original_name)
    )
}

/// Validate one raw `list_tools` entry.
pub fn parse_raw_tool(
    backend_id: &str,
    raw: &serde_json::Value,
) -> Result<ToolDefinition, String> {
    let obj = raw
        .as_object()
        .ok_or_else(|| "tool entry is not an object".to_string())?;

    let name = obj
        .get("name")
        .and_then(|n| n.as_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "missing or empty name".to_string())?;

    let description = obj
        .get("description")
        .and_then(|d| d.as_str())
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| "missing or empty description".to_string())?;

    let schema = SCHEMA_KEYS
        .iter()
        .find_map(|key| obj.get(*key))
        .ok_or_else(|| "missing parameter schema".to_string())?;
    if !schema.is_object() {
        return Err("parameter schema is not an object".into());
    }

    Ok(ToolDefinition {
        backend_id: backend_id.to_string(),
        original_name: name.to_string(),
        description: description.to_string(),
        parameter_schema: schema.clone(),
    })
}

fn raw_tool_name(raw: &serde_json::Value) -> String {
    raw.get("name")
        .and_then(|n| n.as_str())
        .unwrap_or("<unnamed>")
        .to_string()
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `public_name → definition`.
    tools: HashMap<String, ToolDefinition>,
    /// Public names in registration order.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validated tool; returns its public name.
    ///
    /// A tool whose public name is already taken is rejected and the
    /// existing entry stays untouched.
    pub fn register(&mut self, tool: ToolDefinition) -> Result<String, String> {
        let public_name = encode_public_name(&tool.backend_id, &tool.original_name);
        if let Some(existing) = self.tools.get(&public_name) {
            return Err(format!(
                "public name '{public_name}' already used by '{}' on backend '{}'",
                existing.original_name, existing.backend_id
            ));
        }
        self.order.push(public_name.clone());
        self.tools.insert(public_name.clone(), tool);
        Ok(public_name)
    }

    /// Validate and register every raw tool from one backend.
    ///
    /// Malformed and colliding entries are logged and returned as skipped.
    pub fn register_raw_tools(
        &mut self,
        backend_id: &str,
        raw_tools: &[serde_json::Value],
    ) -> Vec<SkippedTool> {
        let mut skipped = Vec::new();
        for raw in raw_tools {
            let result = parse_raw_tool(backend_id, raw).and_then(|tool| self.register(tool));
            if let Err(reason) = result {
                let tool_name = raw_tool_name(raw);
                tracing::warn!(
                    backend = backend_id,
                    tool = %tool_name,
                    reason = %reason,
                    "skipping tool"
                );
                skipped.push(SkippedTool {
                    backend_id: backend_id.to_string(),
                    tool_name,
                    reason,
                });
            }
        }
        skipped
    }

    /// Look up a tool by public name.
    pub fn resolve(&self, public_name: &str) -> Option<&ToolDefinition> {
        self.tools.get(public_name)
    }

    /// Public names in registration order.
    pub fn public_names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools belonging to a specific backend.
    pub fn tools_for_backend(&self, backend_id: &str) -> usize {
        self.tools
            .values()
            .filter(|t| t.backend_id == backend_id)
            .count()
    }

    /// Retain only tools whose public names appear in the allowlist.
    pub fn retain_tools(&mut self, allowed: &HashSet<String>) {
        let before = self.tools.len();
        self.tools.retain(|name, _| allowed.contains(name));
        self.order.retain(|name| allowed.contains(name));
        tracing::info!(
            before,
            after = self.tools.len(),
            "filtered tool registry by enabled_tools allowlist"
        );
    }

    /// Check a call's arguments against the tool's top-level `required` list.
    ///
    /// Deeper schema validation is left to the backend.
    pub fn validate_arguments(
        &self,
        public_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<(), String> {
        let Some(def) = self.tools.get(public_name) else {
            return Err(format!("unknown tool '{public_name}'"));
        };

        let args_obj = arguments.as_object();
        if args_obj.is_none() && def.parameter_schema.get("type").and_then(|t| t.as_str()) == Some("object") {
            return Err("arguments must be a JSON object".into());
        }

        if let Some(required) = def.parameter_schema.get("required").and_then(|r| r.as_array()) {
            for field_name in required.iter().filter_map(|f| f.as_str()) {
                let has_field = args_obj
                    .map(|obj| obj.contains_key(field_name))
                    .unwrap_or(false);
                if !has_field {
                    return Err(format!("missing required field: '{field_name}'"));
                }
            }
        }

        Ok(())
    }

    /// Serialize every tool into function-calling format, in registration
    /// order.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name).map(|def| (name, def)))
            .map(|(name, def)| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": def.description,
                        "parameters": def.parameter_schema,
                    }
                })
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
