use crate::config::{config_schema, Config};
use crate::edit::{self, BatchEditResult, EditOptions, EditOutcome, EditSpec};
use crate::error::ToolError;
use crate::fs::{self, WriteMode};
use crate::protocol::{Request, Response, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};
use crate::search::{self, OutputMode, SearchRequest, SearchResult, SearchSettings};
use anyhow::Result;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, info_span, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct ProtocolError {
	code: i64,
	message: String,
}

impl ProtocolError {
	fn new(code: i64, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into()
		}
	}
}

impl std::fmt::Display for ProtocolError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
	One(String),
	Many(Vec<String>),
}

impl OneOrMany {
	fn into_vec(self) -> Vec<String> {
		match self {
			OneOrMany::One(value) => vec![value],
			OneOrMany::Many(values) => values,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadFileArgs {
	workspace: Option<String>,
	path: String,
	offset: Option<usize>,
	limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteFileArgs {
	workspace: Option<String>,
	path: String,
	content: String,
	mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EditFileArgs {
	workspace: Option<String>,
	#[serde(alias = "path")]
	paths: OneOrMany,
	old_string: String,
	new_string: String,
	#[serde(default)]
	replace_all: bool,
	#[serde(default)]
	use_regex: bool,
	#[serde(default)]
	dry_run: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListDirectoryArgs {
	workspace: Option<String>,
	path: Option<String>,
	#[serde(default)]
	recursive: bool,
	max_depth: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchFilesArgs {
	workspace: Option<String>,
	pattern: String,
	path: Option<String>,
	glob: Option<OneOrMany>,
	output_mode: Option<String>,
	context_lines: Option<usize>,
	#[serde(default)]
	case_insensitive: bool,
	limit: Option<usize>,
	offset: Option<usize>,
}

/// A single path reports its own outcome; a list reports the whole batch.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum EditReply {
	Single(EditOutcome),
	Batch(BatchEditResult),
}

pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		opentelemetry::KeyValue::new("mcp.workspace_count", config.workspaces.len() as i64),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok();
		if let Some(provider) = provider {
			let tracer = provider.tracer(config.otel_service_name.clone());
			global::set_tracer_provider(provider);
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	// stdout carries the protocol
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_writer(std::io::stderr)
		.with_target(false);
	let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin).lines();
	let mut writer = io::BufWriter::new(stdout);
	info!(
		session_id = %config.session_id,
		workspaces = config.workspaces.len(),
		"serving on stdio"
	);
	while let Some(line) = reader.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(&line) {
			Ok(req) => req,
			Err(err) => {
				let resp = Response::err(Value::Null, PARSE_ERROR, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		let Some(id) = req.id.clone() else {
			debug!(method = %req.method, "ignoring notification");
			continue;
		};
		let resp = handle_request(&config, id, &req).await;
		write_response(&mut writer, resp).await?;
	}
	Ok(())
}

async fn handle_request(config: &Config, id: Value, req: &Request) -> Response {
	let tool_name = extract_tool_name(&req.method, &req.params);
	let workspace = extract_workspace(&req.method, &req.params);
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %config.session_id,
		"mcp.method" = %req.method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"mcp.workspace" = workspace.as_deref().unwrap_or(""),
		"mcp.is_error" = tracing::field::Empty,
		"mcp.error_code" = tracing::field::Empty,
		"mcp.count" = tracing::field::Empty,
		"mcp.response_bytes" = tracing::field::Empty,
	);
	let _guard = span.enter();
	match route(config, req).await {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(id, value)
		}
		Err(err) => {
			if let Some(protocol) = err.downcast_ref::<ProtocolError>() {
				Response::err(id, protocol.code, protocol.message.clone())
			}
			else {
				Response::err(id, -32000, err.to_string())
			}
		}
	}
}

async fn route(config: &Config, req: &Request) -> Result<Value> {
	match req.method.as_str() {
		"initialize" => Ok(json!({
			"protocolVersion": "2024-11-05",
			"serverInfo": {
				"name": env!("CARGO_PKG_NAME"),
				"version": env!("CARGO_PKG_VERSION")
			},
			"configSchema": config_schema(),
			"capabilities": {
				"tools": {
					"listChanged": false
				}
			}
		})),
		"ping" => Ok(json!({})),
		"tools/list" => Ok(json!({
			"tools": tool_definitions(),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| ProtocolError::new(INVALID_PARAMS, "name is required"))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			execute_tool(config, name, &arguments).await
		}
		_ => Err(ProtocolError::new(METHOD_NOT_FOUND, "method not found").into()),
	}
}

fn decode<T: DeserializeOwned>(arguments: &Value) -> Result<T> {
	serde_json::from_value(arguments.clone()).map_err(|err| ProtocolError::new(INVALID_PARAMS, format!("invalid arguments: {}", err)).into())
}

async fn execute_tool(config: &Config, name: &str, arguments: &Value) -> Result<Value> {
	if !arguments.is_object() {
		return Err(ProtocolError::new(INVALID_PARAMS, "arguments must be an object").into());
	}
	let result = match name {
		"list_workspaces" => run_tool(
			name,
			|| async {
				let workspaces = config.workspaces
					.iter()
					.map(|workspace| workspace.describe())
					.collect::<Vec<_>>();
				Ok::<_, ToolError>(json!({
					"count": workspaces.len(),
					"workspaces": workspaces,
				}))
			}
		).await,
		"read_file" => {
			let args: ReadFileArgs = decode(arguments)?;
			run_tool(
				name,
				|| async {
					let workspace = config.workspaces.get(args.workspace.as_deref())?;
					fs::read_file(
						workspace,
						&args.path,
						args.offset,
						args.limit,
						&config.limits.read()
					).await
				}
			).await
		}
		"write_file" => {
			let args: WriteFileArgs = decode(arguments)?;
			run_tool(
				name,
				|| async {
					let workspace = config.workspaces.get(args.workspace.as_deref())?;
					let mode = WriteMode::parse(args.mode.as_deref())?;
					fs::write_file(workspace, &args.path, &args.content, mode).await
				}
			).await
		}
		"edit_file" => {
			let args: EditFileArgs = decode(arguments)?;
			run_tool(name, || edit_file_tool(config, args)).await
		}
		"list_directory" => {
			let args: ListDirectoryArgs = decode(arguments)?;
			run_tool(
				name,
				|| async {
					let workspace = config.workspaces.get(args.workspace.as_deref())?;
					fs::list_directory(
						workspace,
						args.path.as_deref(),
						args.recursive,
						args.max_depth,
						config.limits.list_max_entries
					).await
				}
			).await
		}
		"search_files" => {
			let args: SearchFilesArgs = decode(arguments)?;
			run_tool(name, || search_files_tool(config, args)).await
		}
		_ => return Err(ProtocolError::new(METHOD_NOT_FOUND, format!("unknown tool: {}", name)).into()),
	};
	Ok(result)
}

async fn edit_file_tool(config: &Config, args: EditFileArgs) -> Result<EditReply, ToolError> {
	let workspace = config.workspaces.get(args.workspace.as_deref())?;
	let spec = EditSpec {
		old_pattern: args.old_string,
		new_pattern: args.new_string,
		replace_all: args.replace_all,
		use_regex: args.use_regex
	};
	let context = config.limits.edit_preview_context;
	let options = EditOptions {
		apply: !args.dry_run,
		preview_context: (context > 0).then_some(context)
	};
	match args.paths {
		OneOrMany::One(path) => match edit::edit(workspace, &path, &spec, &options).await {
			EditOutcome::Failed { error, .. } => Err(error),
			applied => Ok(EditReply::Single(applied)),
		},
		OneOrMany::Many(paths) => {
			if paths.is_empty() {
				return Err(ToolError::invalid("paths must not be empty"));
			}
			Ok(EditReply::Batch(edit::edit_many(workspace, &paths, &spec, &options).await))
		}
	}
}

async fn search_files_tool(config: &Config, args: SearchFilesArgs) -> Result<SearchResult, ToolError> {
	let workspace = config.workspaces.get(args.workspace.as_deref())?;
	let request = SearchRequest {
		pattern: args.pattern,
		path: args.path,
		globs: args.glob
			.map(OneOrMany::into_vec)
			.unwrap_or_default(),
		mode: OutputMode::parse(args.output_mode.as_deref())?,
		context_lines: args.context_lines,
		case_insensitive: args.case_insensitive,
		offset: args.offset,
		limit: args.limit
	};
	let settings = SearchSettings {
		rg_path: config.rg_path.clone(),
		max_output_bytes: config.limits.search_max_output_bytes
	};
	search::search(workspace, &request, &settings).await
}

async fn run_tool<F, Fut, T>(name: &str, handler: F) -> Value
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Result<T, ToolError>>,
	T: Serialize, {
	let outcome = handler().await.and_then(|structured| {
		serde_json::to_value(structured).map_err(|err| ToolError::Io {
			action: "encode",
			path: name.to_string(),
			reason: err.to_string()
		})
	});
	match outcome {
		Ok(structured) => tool_success(name, structured),
		Err(err) => tool_error(&err),
	}
}

fn tool_success(name: &str, structured: Value) -> Value {
	let message = tool_message(name, &structured);
	json!({
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": message
			}
		],
		"isError": false
	})
}

fn tool_error(err: &ToolError) -> Value {
	let structured = serde_json::to_value(err).unwrap_or_else(|_| json!({
		"code": err.code()
	}));
	json!({
		"isError": true,
		"structuredContent": structured,
		"content": [
			{
				"type": "text",
				"text": err.to_string()
			}
		]
	})
}

fn tool_message(name: &str, structured: &Value) -> String {
	let path = structured.get("path")
		.and_then(Value::as_str)
		.unwrap_or(".");
	match name {
		"list_workspaces" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			format!("Listed {} workspace(s).", count)
		}
		"read_file" => {
			let total = get_u64(structured, "total_lines").unwrap_or(0);
			let start_line = get_u64(structured, "start_line").unwrap_or(1);
			let end_line = get_u64(structured, "end_line").unwrap_or(0);
			if structured.get("code").and_then(Value::as_str) == Some("EMPTY_RANGE") {
				return format!(
					"No lines returned from {}: offset {} is past the last line ({}).",
					path, start_line, total
				);
			}
			let mut message = format!("Read lines {}-{} of {} from {}.", start_line, end_line, total, path);
			if get_bool(structured, "truncated") {
				message.push_str(&format!(" More lines follow; continue with offset={}.", end_line + 1));
			}
			if get_bool(structured, "long_lines") {
				message.push_str(" Some long lines were cut.");
			}
			message
		}
		"write_file" => {
			let bytes = get_u64(structured, "bytes_written").unwrap_or(0);
			let mode = structured.get("mode")
				.and_then(Value::as_str)
				.unwrap_or("overwrite");
			let mut message = format!("Wrote {} bytes to {} ({}).", bytes, path, mode);
			if get_bool(structured, "overwrote_existing") {
				let previous = get_u64(structured, "previous_bytes").unwrap_or(0);
				message.push_str(&format!(" Replaced {} bytes of existing content.", previous));
			}
			message
		}
		"edit_file" => {
			if let Some(total) = get_u64(structured, "total_files") {
				let succeeded = get_u64(structured, "succeeded").unwrap_or(0);
				let status = structured.get("status")
					.and_then(Value::as_str)
					.unwrap_or("complete");
				return format!("Edited {} of {} file(s) ({}).", succeeded, total, status);
			}
			let occurrences = get_u64(structured, "occurrences").unwrap_or(0);
			if get_bool(structured, "applied") {
				format!("Replaced {} occurrence(s) in {}.", occurrences, path)
			}
			else {
				format!("Dry run: {} occurrence(s) would change in {}; nothing written.", occurrences, path)
			}
		}
		"list_directory" => {
			let count = get_u64(structured, "count").unwrap_or(0);
			if get_bool(structured, "truncated") {
				format!("Listed {} entries under {}. Listing truncated.", count, path)
			}
			else {
				format!("Listed {} entries under {}.", count, path)
			}
		}
		"search_files" => {
			let total = get_u64(structured, "total").unwrap_or(0);
			let returned = get_u64(structured, "returned").unwrap_or(0);
			let offset = get_u64(structured, "offset").unwrap_or(0);
			let mut message = format!("Returned {} of {} result(s) from offset {}.", returned, total, offset);
			if get_bool(structured, "has_more") {
				message.push_str(&format!(" Continue with offset={}.", offset + returned));
			}
			if get_bool(structured, "output_truncated") {
				message.push_str(" Search output hit the size limit; narrow the pattern, path, or glob.");
			}
			message
		}
		_ => "Completed tool call.".to_string(),
	}
}

fn get_u64(value: &Value, key: &str) -> Option<u64> {
	value.get(key).and_then(Value::as_u64)
}

fn get_bool(value: &Value, key: &str) -> bool {
	value.get(key)
		.and_then(Value::as_bool)
		.unwrap_or(false)
}

fn tool_definitions() -> Vec<Value> {
	let workspace = json!({
		"type": "string",
		"description": "Workspace key from list_workspaces. Optional when exactly one workspace is configured."
	});
	let path_or_paths = json!({
		"oneOf": [
			{ "type": "string" },
			{ "type": "array", "items": { "type": "string" }, "minItems": 1 }
		]
	});
	vec![
	json!({
		"name": "list_workspaces",
		"description": "list configured workspaces with their roots and write allowlists",
		"annotations": { "readOnlyHint": true },
		"inputSchema": {
			"type": "object",
			"properties": {},
			"additionalProperties": false
		}
	}),
	json!({
		"name": "read_file",
		"description": "read a window of lines from a file, numbered from 1",
		"annotations": { "readOnlyHint": true },
		"inputSchema": {
			"type": "object",
			"properties": {
				"workspace": workspace,
				"path": { "type": "string", "description": "Path relative to the workspace root. A leading / is also root-relative." },
				"offset": { "type": "integer", "minimum": 0, "description": "First line to return (1-indexed)." },
				"limit": { "type": "integer", "minimum": 0, "description": "Maximum lines to return. 0 reads the whole file." }
			},
			"required": ["path"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "write_file",
		"description": "write a whole file atomically; the path must match the workspace write allowlist",
		"annotations": { "destructiveHint": true },
		"inputSchema": {
			"type": "object",
			"properties": {
				"workspace": workspace,
				"path": { "type": "string" },
				"content": { "type": "string" },
				"mode": { "type": "string", "enum": ["overwrite", "append", "prepend"] }
			},
			"required": ["path", "content"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "edit_file",
		"description": "find and replace in one or more files; old_string must match exactly once unless replace_all is set",
		"annotations": { "destructiveHint": true },
		"inputSchema": {
			"type": "object",
			"properties": {
				"workspace": workspace,
				"paths": path_or_paths,
				"path": { "type": "string", "description": "Alias for a single entry in paths." },
				"old_string": { "type": "string", "minLength": 1 },
				"new_string": { "type": "string" },
				"replace_all": { "type": "boolean" },
				"use_regex": { "type": "boolean", "description": "Treat old_string as a regex; new_string may use $1, ${1}, or ${name}." },
				"dry_run": { "type": "boolean", "description": "Validate and return a diff without writing." }
			},
			"required": ["old_string", "new_string"],
			"additionalProperties": false
		}
	}),
	json!({
		"name": "list_directory",
		"description": "list directory entries, skipping hidden and ignored files",
		"annotations": { "readOnlyHint": true },
		"inputSchema": {
			"type": "object",
			"properties": {
				"workspace": workspace,
				"path": { "type": "string" },
				"recursive": { "type": "boolean" },
				"max_depth": { "type": "integer", "minimum": 1 }
			},
			"additionalProperties": false
		}
	}),
	json!({
		"name": "search_files",
		"description": "search file contents with ripgrep and return matches, matching files, or per-file counts",
		"annotations": { "readOnlyHint": true },
		"inputSchema": {
			"type": "object",
			"properties": {
				"workspace": workspace,
				"pattern": { "type": "string", "description": "Regular expression (ripgrep syntax)." },
				"path": { "type": "string" },
				"glob": path_or_paths,
				"output_mode": { "type": "string", "enum": ["content", "files_with_matches", "count"] },
				"context_lines": { "type": "integer", "minimum": 0, "description": "Context lines around each match (content mode)." },
				"case_insensitive": { "type": "boolean" },
				"limit": { "type": "integer", "minimum": 0 },
				"offset": { "type": "integer", "minimum": 0 }
			},
			"required": ["pattern"],
			"additionalProperties": false
		}
	}),
	]
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn extract_workspace(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("arguments")
		.and_then(|args| args.get("workspace"))
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let Some(structured) = result.get("structuredContent") else {
		return;
	};
	let is_error = get_bool(result, "isError");
	span.record("mcp.is_error", is_error);
	if is_error {
		if let Some(code) = structured.get("code").and_then(Value::as_str) {
			span.record("mcp.error_code", code);
		}
	}
	let count = ["count", "returned", "total_files", "occurrences"].iter().find_map(|key| get_u64(structured, key));
	if let Some(count) = count {
		span.record("mcp.count", count);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn edit_arguments_accept_path_alias_and_lists() {
		let single: EditFileArgs = decode(&json!({
			"path": "a.rs",
			"old_string": "x",
			"new_string": "y"
		})).expect("single");
		assert!(matches!(single.paths, OneOrMany::One(ref path) if path == "a.rs"));
		assert!(!single.replace_all && !single.use_regex && !single.dry_run);
		let many: EditFileArgs = decode(&json!({
			"paths": ["a.rs", "b.rs"],
			"old_string": "x",
			"new_string": "y",
			"dry_run": true
		})).expect("many");
		assert_eq!(many.paths.into_vec(), vec!["a.rs", "b.rs"]);
	}

	#[test]
	fn malformed_arguments_are_invalid_params() {
		let err = decode::<ReadFileArgs>(&json!({ "file": "a.rs" })).expect_err("unknown field");
		let protocol = err.downcast_ref::<ProtocolError>().expect("protocol error");
		assert_eq!(protocol.code, INVALID_PARAMS);
	}

	#[test]
	fn error_envelope_carries_code_and_message() {
		let value = tool_error(&ToolError::NotUnique {
			path: "a.rs".to_string(),
			count: 3
		});
		assert_eq!(value["isError"], true);
		assert_eq!(value["structuredContent"]["code"], "NOT_UNIQUE");
		assert_eq!(value["structuredContent"]["count"], 3);
		let text = value["content"][0]["text"].as_str().expect("text");
		assert!(text.contains("replace_all=true"));
	}

	#[test]
	fn messages_point_at_the_next_page() {
		let read = tool_message("read_file", &json!({
			"path": "a.rs",
			"total_lines": 600,
			"start_line": 1,
			"end_line": 500,
			"truncated": true
		}));
		assert!(read.contains("offset=501"));
		let search = tool_message("search_files", &json!({
			"total": 12,
			"returned": 5,
			"offset": 5,
			"has_more": true
		}));
		assert!(search.contains("offset=10"));
	}

	#[test]
	fn tool_list_covers_every_tool() {
		let names = tool_definitions()
			.iter()
			.filter_map(|tool| tool.get("name").and_then(Value::as_str).map(str::to_string))
			.collect::<Vec<_>>();
		assert_eq!(names, vec!["list_workspaces", "read_file", "write_file", "edit_file", "list_directory", "search_files"]);
	}
}
