use crate::allowlist::Allowlist;
use crate::fs::ReadLimits;
use crate::sandbox;
use crate::workspace::{Workspace, Workspaces};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Limits {
	pub read_max_file_bytes: u64,
	pub read_default_limit: usize,
	pub read_max_line_bytes: usize,
	pub search_max_output_bytes: usize,
	pub list_max_entries: usize,
	pub edit_preview_context: usize,
}

impl Default for Limits {
	fn default() -> Self {
		let read = ReadLimits::default();
		Self {
			read_max_file_bytes: read.max_file_bytes,
			read_default_limit: read.default_limit,
			read_max_line_bytes: read.max_line_bytes,
			search_max_output_bytes: 8 * 1024 * 1024,
			list_max_entries: 1000,
			edit_preview_context: 3
		}
	}
}

impl Limits {
	pub fn read(&self) -> ReadLimits {
		ReadLimits {
			max_file_bytes: self.read_max_file_bytes,
			default_limit: self.read_default_limit,
			max_line_bytes: self.read_max_line_bytes
		}
	}
}

#[derive(Clone, Debug)]
pub struct Config {
	pub workspaces: Workspaces,
	pub limits: Limits,
	pub rg_path: String,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
	/// Problems found while loading; logged once tracing is up.
	pub diagnostics: Vec<String>,
}

#[derive(Debug, Default, PartialEq)]
struct Overrides {
	config_path: Option<String>,
	rg_path: Option<String>,
	otel_enabled: Option<bool>,
	otel_endpoint: Option<String>,
	otel_service_name: Option<String>,
	print_schema: bool,
}

impl Overrides {
	/// Fills every unset field from `other`.
	fn or(self, other: Overrides) -> Overrides {
		Overrides {
			config_path: self.config_path.or(other.config_path),
			rg_path: self.rg_path.or(other.rg_path),
			otel_enabled: self.otel_enabled.or(other.otel_enabled),
			otel_endpoint: self.otel_endpoint.or(other.otel_endpoint),
			otel_service_name: self.otel_service_name.or(other.otel_service_name),
			print_schema: self.print_schema || other.print_schema
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
	#[serde(default)]
	workspaces: BTreeMap<String, WorkspaceFile>,
	#[serde(default)]
	limits: LimitsFile,
	rg_path: Option<String>,
	otel_enabled: Option<bool>,
	otel_endpoint: Option<String>,
	otel_service_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkspaceFile {
	root: String,
	name: Option<String>,
	#[serde(default, alias = "writeAllowlist")]
	write_allowlist: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimitsFile {
	read_max_file_bytes: Option<u64>,
	read_default_limit: Option<usize>,
	read_max_line_bytes: Option<usize>,
	search_max_output_bytes: Option<usize>,
	list_max_entries: Option<usize>,
	edit_preview_context: Option<usize>,
}

pub fn load_config() -> Result<Config> {
	let flags = parse_args(std::env::args().skip(1))?;
	let overrides = flags.or(env_overrides()?);
	if overrides.print_schema {
		let payload = serde_json::to_string_pretty(&config_schema())?;
		println!("{}", payload);
		std::process::exit(0);
	}
	let file = match overrides.config_path.as_deref() {
		Some(path) => Some(load_config_file(path)?),
		None => None,
	};
	build_config(overrides, file)
}

fn parse_args<I>(args: I) -> Result<Overrides>
where
	I: IntoIterator<Item = String>, {
	let mut overrides = Overrides::default();
	let mut args = args.into_iter();
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--config" => {
				let value = args.next().ok_or_else(|| anyhow!("--config requires a value"))?;
				overrides.config_path = Some(value);
			}
			"--rg-path" => {
				let value = args.next().ok_or_else(|| anyhow!("--rg-path requires a value"))?;
				overrides.rg_path = Some(value);
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				overrides.otel_enabled = Some(parse_bool(&value, "--otel-enabled")?);
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				overrides.otel_endpoint = Some(value);
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				overrides.otel_service_name = Some(value);
			}
			"--print-config-schema" => {
				overrides.print_schema = true;
			}
			_ => return Err(anyhow!("unknown argument: {}", arg)),
		}
	}
	Ok(overrides)
}

fn env_overrides() -> Result<Overrides> {
	let otel_enabled = match env_value("MCP_OTEL_ENABLED") {
		Some(value) => Some(parse_bool(&value, "MCP_OTEL_ENABLED")?),
		None => None,
	};
	Ok(Overrides {
		config_path: env_value("MCP_CONFIG"),
		rg_path: env_value("MCP_RG_PATH"),
		otel_enabled,
		otel_endpoint: env_value("MCP_OTEL_ENDPOINT"),
		otel_service_name: env_value("MCP_OTEL_SERVICE_NAME"),
		print_schema: false
	})
}

fn env_value(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.filter(|value| !value.trim().is_empty())
}

fn load_config_file(path: &str) -> Result<ConfigFile> {
	let content = std::fs::read_to_string(path)
		.map_err(|err| anyhow!("failed to read config {}: {}", path, err))?;
	parse_config_file(&content).map_err(|err| anyhow!("failed to parse config {}: {}", path, err))
}

fn parse_config_file(content: &str) -> Result<ConfigFile> {
	Ok(serde_json::from_str(content)?)
}

fn build_config(overrides: Overrides, file: Option<ConfigFile>) -> Result<Config> {
	let mut config = Config {
		workspaces: Workspaces::default(),
		limits: Limits::default(),
		rg_path: overrides.rg_path.unwrap_or_else(|| "rg".to_string()),
		otel_enabled: overrides.otel_enabled.unwrap_or(false),
		otel_endpoint: overrides.otel_endpoint.unwrap_or_else(|| "http://127.0.0.1:4317".to_string()),
		otel_service_name: overrides.otel_service_name.unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
		session_id: uuid::Uuid::new_v4().to_string(),
		diagnostics: Vec::new()
	};
	let Some(file) = file else {
		config.diagnostics.push("no configuration file given (--config or MCP_CONFIG); serving zero workspaces".to_string());
		return Ok(config);
	};
	apply_limits(&mut config.limits, file.limits);
	if let Some(rg_path) = file.rg_path {
		config.rg_path = rg_path;
	}
	if let Some(enabled) = file.otel_enabled {
		config.otel_enabled = enabled;
	}
	if let Some(endpoint) = file.otel_endpoint {
		config.otel_endpoint = endpoint;
	}
	if let Some(service) = file.otel_service_name {
		config.otel_service_name = service;
	}
	let mut workspaces = Vec::new();
	for (key, entry) in file.workspaces {
		if key.trim().is_empty() {
			return Err(anyhow!("workspace keys must not be empty"));
		}
		let root = resolve_root(&key, &entry.root, &mut config.diagnostics)?;
		let allowlist = Allowlist::new(&entry.write_allowlist).map_err(|err| anyhow!("workspace {}: {}", key, err))?;
		workspaces.push(Workspace {
			name: entry.name.unwrap_or_else(|| key.clone()),
			key,
			root,
			allowlist
		});
	}
	if workspaces.is_empty() {
		config.diagnostics.push("configuration declares no workspaces".to_string());
	}
	config.workspaces = Workspaces::new(workspaces);
	Ok(config)
}

fn apply_limits(limits: &mut Limits, file: LimitsFile) {
	if let Some(value) = file.read_max_file_bytes {
		limits.read_max_file_bytes = value;
	}
	if let Some(value) = file.read_default_limit {
		limits.read_default_limit = value;
	}
	if let Some(value) = file.read_max_line_bytes {
		limits.read_max_line_bytes = value;
	}
	if let Some(value) = file.search_max_output_bytes {
		limits.search_max_output_bytes = value;
	}
	if let Some(value) = file.list_max_entries {
		limits.list_max_entries = value;
	}
	if let Some(value) = file.edit_preview_context {
		limits.edit_preview_context = value;
	}
}

fn resolve_root(key: &str, raw: &str, diagnostics: &mut Vec<String>) -> Result<PathBuf> {
	let path = Path::new(raw);
	if !path.is_absolute() {
		return Err(anyhow!("workspace {}: root must be an absolute path (got {})", key, raw));
	}
	let normalized = sandbox::normalize_path(path);
	match std::fs::canonicalize(&normalized) {
		Ok(canonical) => {
			if !canonical.is_dir() {
				diagnostics.push(format!("workspace {}: root {} is not a directory", key, canonical.display()));
			}
			Ok(canonical)
		}
		Err(_) => {
			diagnostics.push(format!("workspace {}: root {} does not exist", key, normalized.display()));
			Ok(normalized)
		}
	}
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

pub fn config_schema() -> Value {
	json!({
		"$schema": "http://json-schema.org/draft-07/schema#",
		"title": "mcp-workspace configuration",
		"type": "object",
		"additionalProperties": false,
		"properties": {
			"workspaces": {
				"type": "object",
				"description": "Named workspaces keyed by the identifier tools accept as `workspace`.",
				"additionalProperties": {
					"type": "object",
					"additionalProperties": false,
					"properties": {
						"root": { "type": "string", "description": "Absolute root directory. Every path resolves inside it." },
						"name": { "type": "string", "description": "Display name. Defaults to the key." },
						"write_allowlist": {
							"type": "array",
							"items": { "type": "string" },
							"description": "Glob patterns of root-relative paths that may be written or edited. Empty means read-only. Alias: writeAllowlist."
						}
					},
					"required": ["root"]
				}
			},
			"limits": {
				"type": "object",
				"additionalProperties": false,
				"properties": {
					"read_max_file_bytes": { "type": "integer", "minimum": 0, "description": "Files larger than this are refused by read_file." },
					"read_default_limit": { "type": "integer", "minimum": 0, "description": "Lines returned when read_file gets no limit." },
					"read_max_line_bytes": { "type": "integer", "minimum": 0, "description": "Longer lines are cut with a truncation marker." },
					"search_max_output_bytes": { "type": "integer", "minimum": 0, "description": "Cap on raw search tool output." },
					"list_max_entries": { "type": "integer", "minimum": 0, "description": "Cap on list_directory entries." },
					"edit_preview_context": { "type": "integer", "minimum": 0, "description": "Lines of context in edit previews." }
				}
			},
			"rg_path": { "type": "string", "description": "ripgrep executable." },
			"otel_enabled": { "type": "boolean", "description": "Export traces over OTLP." },
			"otel_endpoint": { "type": "string", "description": "OTLP gRPC endpoint." },
			"otel_service_name": { "type": "string", "description": "OTEL service.name." }
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn args(items: &[&str]) -> Vec<String> {
		items.iter().map(|item| item.to_string()).collect()
	}

	#[test]
	fn parses_flags() {
		let overrides = parse_args(args(&["--config", "/etc/ws.json", "--rg-path", "/usr/bin/rg", "--otel-enabled", "off"])).expect("parse");
		assert_eq!(overrides.config_path.as_deref(), Some("/etc/ws.json"));
		assert_eq!(overrides.rg_path.as_deref(), Some("/usr/bin/rg"));
		assert_eq!(overrides.otel_enabled, Some(false));
		assert!(parse_args(args(&["--root", "/tmp"])).is_err());
		assert!(parse_args(args(&["--config"])).is_err());
		assert!(parse_args(args(&["--otel-enabled", "maybe"])).is_err());
	}

	#[test]
	fn flags_win_over_environment() {
		let flags = Overrides {
			rg_path: Some("flag-rg".to_string()),
			..Overrides::default()
		};
		let env = Overrides {
			rg_path: Some("env-rg".to_string()),
			otel_endpoint: Some("http://collector:4317".to_string()),
			..Overrides::default()
		};
		let merged = flags.or(env);
		assert_eq!(merged.rg_path.as_deref(), Some("flag-rg"));
		assert_eq!(merged.otel_endpoint.as_deref(), Some("http://collector:4317"));
	}

	#[test]
	fn missing_config_serves_nothing() {
		let config = build_config(Overrides::default(), None).expect("config");
		assert_eq!(config.workspaces.len(), 0);
		assert_eq!(config.diagnostics.len(), 1);
		assert!(!config.otel_enabled);
		assert_eq!(config.rg_path, "rg");
	}

	#[test]
	fn builds_workspaces_from_file() {
		let dir = tempfile::tempdir().expect("tempdir");
		let raw = json!({
			"workspaces": {
				"app": { "root": dir.path().join("sub/..").display().to_string(), "writeAllowlist": ["src/**"] },
				"ghost": { "root": "/definitely/not/here", "name": "Ghost" }
			},
			"limits": { "read_default_limit": 50 },
			"rg_path": "/opt/rg"
		});
		let file = parse_config_file(&raw.to_string()).expect("parse");
		let flags = Overrides {
			rg_path: Some("flag-rg".to_string()),
			..Overrides::default()
		};
		let config = build_config(flags, Some(file)).expect("build");
		assert_eq!(config.rg_path, "/opt/rg");
		assert_eq!(config.limits.read_default_limit, 50);
		assert_eq!(config.limits.list_max_entries, 1000);
		let app = config.workspaces.get(Some("app")).expect("app");
		assert_eq!(app.name, "app");
		assert_eq!(app.root, std::fs::canonicalize(dir.path()).expect("canonical"));
		assert!(app.allowlist.is_allowed("src/lib.rs"));
		let ghost = config.workspaces.get(Some("ghost")).expect("ghost");
		assert_eq!(ghost.name, "Ghost");
		assert!(ghost.allowlist.patterns().is_empty());
		assert!(config.diagnostics.iter().any(|message| message.contains("does not exist")));
	}

	#[test]
	fn rejects_unknown_keys_and_relative_roots() {
		assert!(parse_config_file(r#"{"roots": []}"#).is_err());
		assert!(parse_config_file(r#"{"workspaces": {"a": {"root": "/a", "deny": []}}}"#).is_err());
		assert!(parse_config_file(r#"{"limits": {"find_limit": 3}}"#).is_err());
		let file = parse_config_file(r#"{"workspaces": {"a": {"root": "relative/dir"}}}"#).expect("parse");
		assert!(build_config(Overrides::default(), Some(file)).is_err());
	}

	#[test]
	fn invalid_allowlist_glob_fails_startup() {
		let file = parse_config_file(r#"{"workspaces": {"a": {"root": "/a", "write_allowlist": ["src/[x"]}}}"#).expect("parse");
		let err = build_config(Overrides::default(), Some(file)).expect_err("invalid glob");
		assert!(err.to_string().contains("workspace a"));
	}

	#[test]
	fn schema_lists_top_level_keys() {
		let schema = config_schema();
		let properties = schema["properties"].as_object().expect("properties");
		for key in ["workspaces", "limits", "rg_path", "otel_enabled", "otel_endpoint", "otel_service_name"] {
			assert!(properties.contains_key(key), "missing {}", key);
		}
	}
}
