use crate::error::ToolError;
use crate::sandbox;
use crate::workspace::Workspace;
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

const STDERR_LIMIT: u64 = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
	Content,
	FilesWithMatches,
	Count,
}

impl OutputMode {
	pub fn parse(value: Option<&str>) -> Result<Self, ToolError> {
		match value.unwrap_or("content") {
			"content" => Ok(OutputMode::Content),
			"files_with_matches" | "files" => Ok(OutputMode::FilesWithMatches),
			"count" => Ok(OutputMode::Count),
			other => Err(ToolError::invalid(format!("output_mode must be content, files_with_matches, or count (got {})", other))),
		}
	}
}

/// One line of structured search output, independent of the tool that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchEvent {
	Match {
		file: String,
		line_number: u64,
		text: String
	},
	Context {
		text: String
	},
	FileBoundary,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContentMatch {
	pub file: String,
	pub line: u64,
	pub text: String,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub before: Vec<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub after: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileCount {
	pub file: String,
	pub count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SearchProjection {
	Content {
		matches: Vec<ContentMatch>
	},
	FilesWithMatches {
		files: Vec<String>
	},
	Count {
		counts: Vec<FileCount>
	},
}

impl SearchProjection {
	pub fn len(&self) -> usize {
		match self {
			SearchProjection::Content { matches } => matches.len(),
			SearchProjection::FilesWithMatches { files } => files.len(),
			SearchProjection::Count { counts } => counts.len(),
		}
	}

	fn slice(self, offset: usize, limit: Option<usize>) -> Self {
		fn window<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
			let iter = items.into_iter().skip(offset);
			match limit {
				Some(limit) => iter.take(limit).collect(),
				None => iter.collect(),
			}
		}
		match self {
			SearchProjection::Content { matches } => SearchProjection::Content {
				matches: window(matches, offset, limit)
			},
			SearchProjection::FilesWithMatches { files } => SearchProjection::FilesWithMatches {
				files: window(files, offset, limit)
			},
			SearchProjection::Count { counts } => SearchProjection::Count {
				counts: window(counts, offset, limit)
			},
		}
	}
}

#[derive(Default)]
struct Normalizer {
	matches: Vec<ContentMatch>,
	pending: Vec<String>,
	previous: Option<usize>,
	files: Vec<String>,
	counts: HashMap<String, usize>,
}

impl Normalizer {
	fn push(&mut self, event: MatchEvent) {
		match event {
			MatchEvent::Context { text } => self.pending.push(text),
			MatchEvent::Match { file, line_number, text } => {
				// Context between two matches of one file belongs to both.
				if let Some(previous) = self.previous {
					self.matches[previous].after.extend(self.pending.iter().cloned());
				}
				let count = self.counts
					.entry(file.clone())
					.or_insert(0);
				if *count == 0 {
					self.files.push(file.clone());
				}
				*count += 1;
				self.matches.push(ContentMatch {
					file,
					line: line_number,
					text,
					before: std::mem::take(&mut self.pending),
					after: Vec::new()
				});
				self.previous = Some(self.matches.len() - 1);
			}
			MatchEvent::FileBoundary => self.flush(),
		}
	}

	fn flush(&mut self) {
		let pending = std::mem::take(&mut self.pending);
		if let Some(previous) = self.previous.take() {
			self.matches[previous].after.extend(pending);
		}
	}

	fn finish(mut self, mode: OutputMode) -> SearchProjection {
		self.flush();
		match mode {
			OutputMode::Content => SearchProjection::Content {
				matches: self.matches
			},
			OutputMode::FilesWithMatches => SearchProjection::FilesWithMatches {
				files: self.files
			},
			OutputMode::Count => {
				let counts = self.files
					.into_iter()
					.map(|file| {
						let count = self.counts.get(&file).copied().unwrap_or(0);
						FileCount {
							file,
							count
						}
					})
					.collect();
				SearchProjection::Count {
					counts
				}
			}
		}
	}
}

pub fn normalize<I>(events: I, mode: OutputMode) -> SearchProjection
where
	I: IntoIterator<Item = MatchEvent>, {
	let mut normalizer = Normalizer::default();
	for event in events {
		normalizer.push(event);
	}
	normalizer.finish(mode)
}

#[derive(Debug, Serialize)]
pub struct SearchPage {
	#[serde(flatten)]
	pub projection: SearchProjection,
	pub total: usize,
	pub offset: usize,
	pub returned: usize,
	pub has_more: bool,
}

pub fn paginate(projection: SearchProjection, offset: Option<usize>, limit: Option<usize>) -> SearchPage {
	let total = projection.len();
	let offset = offset.unwrap_or(0);
	let projection = projection.slice(offset, limit);
	let returned = projection.len();
	SearchPage {
		projection,
		total,
		offset,
		returned,
		has_more: offset.saturating_add(returned) < total
	}
}

/// Converts one line of `rg --json` output. Message types the normalizer has no use for yield `None`.
pub fn parse_rg_event(line: &str, root: &Path) -> Result<Option<MatchEvent>> {
	let value: Value = serde_json::from_str(line)?;
	let value_type = value.get("type")
		.and_then(Value::as_str)
		.unwrap_or("");
	if value_type == "begin" || value_type == "end" {
		return Ok(Some(MatchEvent::FileBoundary));
	}
	if value_type != "match" && value_type != "context" {
		return Ok(None);
	}
	let data = value.get("data").ok_or_else(|| anyhow!("rg entry missing data"))?;
	let Some(line_text) = data.get("lines")
		.and_then(|lines| lines.get("text"))
		.and_then(Value::as_str) else {
		// non-UTF-8 lines arrive base64-encoded under "bytes"
		return Ok(None);
	};
	let text = line_text.trim_end_matches(['\n', '\r']).to_string();
	if value_type == "context" {
		return Ok(Some(MatchEvent::Context {
			text
		}));
	}
	let path = data.get("path")
		.and_then(|p| p.get("text"))
		.and_then(Value::as_str)
		.ok_or_else(|| anyhow!("rg match missing path"))?;
	let line_number = data.get("line_number")
		.and_then(Value::as_u64)
		.ok_or_else(|| anyhow!("rg match missing line number"))?;
	Ok(Some(MatchEvent::Match {
		file: normalize_search_path(root, path),
		line_number,
		text
	}))
}

fn normalize_search_path(root: &Path, path_text: &str) -> String {
	let path = Path::new(path_text);
	let absolute = if path.is_absolute() {
		path.to_path_buf()
	}
	else {
		root.join(path)
	};
	let normalized = sandbox::normalize_path(&absolute);
	if normalized.starts_with(root) {
		return sandbox::relative_to_root(root, &normalized);
	}
	path_text.to_string()
}

#[derive(Clone, Debug)]
pub struct SearchRequest {
	pub pattern: String,
	pub path: Option<String>,
	pub globs: Vec<String>,
	pub mode: OutputMode,
	pub context_lines: Option<usize>,
	pub case_insensitive: bool,
	pub offset: Option<usize>,
	pub limit: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct SearchSettings {
	pub rg_path: String,
	pub max_output_bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
	pub pattern: String,
	pub path: String,
	#[serde(flatten)]
	pub page: SearchPage,
	pub output_truncated: bool,
}

pub async fn search(workspace: &Workspace, request: &SearchRequest, settings: &SearchSettings) -> Result<SearchResult, ToolError> {
	if request.pattern.is_empty() {
		return Err(ToolError::invalid("pattern is required"));
	}
	let target = workspace.resolve(request.path.as_deref().unwrap_or(""))?;
	let rel = sandbox::display_relative(&target.rel).to_string();
	tokio::fs::metadata(&target.absolute).await.map_err(|err| ToolError::io("search", &rel, &err))?;
	let args = rg_args(request, &rel);
	let output = run_rg(&workspace.root, &args, settings, &rel).await?;
	let mut events = Vec::new();
	for line in output.stdout.lines() {
		if line.trim().is_empty() {
			continue;
		}
		let event = parse_rg_event(line, &workspace.root).map_err(|err| ToolError::Io {
			action: "search",
			path: rel.clone(),
			reason: format!("unreadable rg output: {}", err)
		})?;
		if let Some(event) = event {
			events.push(event);
		}
	}
	debug!(events = events.len(), truncated = output.truncated, "normalizing search output");
	let projection = normalize(events, request.mode);
	Ok(SearchResult {
		pattern: request.pattern.clone(),
		path: rel,
		page: paginate(projection, request.offset, request.limit),
		output_truncated: output.truncated
	})
}

fn rg_args(request: &SearchRequest, rel: &str) -> Vec<String> {
	let mut args = vec![
		"--json".to_string(),
		"--no-config".to_string(),
		"--sort".to_string(),
		"path".to_string(),
	];
	if request.case_insensitive {
		args.push("--ignore-case".to_string());
	}
	else {
		args.push("--case-sensitive".to_string());
	}
	if request.mode == OutputMode::Content {
		if let Some(context) = request.context_lines {
			args.push("-C".to_string());
			args.push(context.to_string());
		}
	}
	for glob in &request.globs {
		args.push("--glob".to_string());
		args.push(glob.clone());
	}
	args.push("--regexp".to_string());
	args.push(request.pattern.clone());
	args.push("--".to_string());
	args.push(rel.to_string());
	args
}

struct RgOutput {
	stdout: String,
	truncated: bool,
}

async fn run_rg(root: &Path, args: &[String], settings: &SearchSettings, rel: &str) -> Result<RgOutput, ToolError> {
	let fail = |reason: String| ToolError::Io {
		action: "search",
		path: rel.to_string(),
		reason
	};
	let mut cmd = Command::new(&settings.rg_path);
	cmd.args(args);
	cmd.current_dir(root);
	cmd.stdin(Stdio::null());
	cmd.stdout(Stdio::piped());
	cmd.stderr(Stdio::piped());
	cmd.kill_on_drop(true);
	let mut child = cmd.spawn().map_err(|err| {
		if err.kind() == std::io::ErrorKind::NotFound {
			fail(format!("{} not found; install ripgrep or set rg_path", settings.rg_path))
		}
		else {
			fail(format!("failed to start {}: {}", settings.rg_path, err))
		}
	})?;
	let stdout = child.stdout
		.take()
		.ok_or_else(|| fail("rg stdout missing".to_string()))?;
	let stderr = child.stderr
		.take()
		.ok_or_else(|| fail("rg stderr missing".to_string()))?;
	let stderr_task = tokio::spawn(read_bounded(stderr, STDERR_LIMIT));
	let (mut buffer, truncated) = read_bounded(stdout, settings.max_output_bytes as u64).await.map_err(|err| fail(err.to_string()))?;
	if truncated {
		warn!(limit = settings.max_output_bytes, "search output exceeded limit; killing rg");
		let _ = child.kill().await;
		let keep = buffer.iter()
			.rposition(|byte| *byte == b'\n')
			.map(|index| index + 1)
			.unwrap_or(0);
		buffer.truncate(keep);
		return Ok(RgOutput {
			stdout: String::from_utf8_lossy(&buffer).into_owned(),
			truncated
		});
	}
	let status = child.wait().await.map_err(|err| fail(err.to_string()))?;
	let stderr_output = match stderr_task.await {
		Ok(Ok((bytes, _))) => String::from_utf8_lossy(&bytes).into_owned(),
		_ => String::new(),
	};
	// exit 1 means no matches
	if !status.success() && status.code() != Some(1) {
		return Err(fail(format!("rg failed: {}", stderr_output.trim())));
	}
	Ok(RgOutput {
		stdout: String::from_utf8_lossy(&buffer).into_owned(),
		truncated
	})
}

async fn read_bounded<R>(reader: R, limit: u64) -> std::io::Result<(Vec<u8>, bool)>
where
	R: AsyncRead + Unpin, {
	let mut buffer = Vec::new();
	let mut limited = reader.take(limit.saturating_add(1));
	limited.read_to_end(&mut buffer).await?;
	let truncated = buffer.len() as u64 > limit;
	if truncated {
		buffer.truncate(limit as usize);
	}
	Ok((buffer, truncated))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::allowlist::Allowlist;
	use std::path::PathBuf;

	fn hit(file: &str, line: u64, text: &str) -> MatchEvent {
		MatchEvent::Match {
			file: file.to_string(),
			line_number: line,
			text: text.to_string()
		}
	}

	fn ctx(text: &str) -> MatchEvent {
		MatchEvent::Context {
			text: text.to_string()
		}
	}

	fn sample_events() -> Vec<MatchEvent> {
		vec![
			MatchEvent::FileBoundary,
			ctx("a0"),
			hit("a.rs", 2, "a-hit-1"),
			ctx("a3"),
			ctx("a4"),
			hit("a.rs", 5, "a-hit-2"),
			ctx("a6"),
			MatchEvent::FileBoundary,
			MatchEvent::FileBoundary,
			ctx("b0"),
			hit("b.rs", 2, "b-hit-1"),
			hit("b.rs", 3, "b-hit-2"),
			MatchEvent::FileBoundary,
			MatchEvent::FileBoundary,
			hit("c.rs", 9, "c-hit-1"),
			MatchEvent::FileBoundary,
		]
	}

	fn content(projection: SearchProjection) -> Vec<ContentMatch> {
		match projection {
			SearchProjection::Content { matches } => matches,
			other => panic!("expected content projection, got {:?}", other),
		}
	}

	#[test]
	fn context_between_matches_belongs_to_both() {
		let matches = content(normalize(sample_events(), OutputMode::Content));
		assert_eq!(matches.len(), 5);
		assert_eq!(matches[0].before, vec!["a0"]);
		assert_eq!(matches[0].after, vec!["a3", "a4"]);
		assert_eq!(matches[1].before, vec!["a3", "a4"]);
		assert_eq!(matches[1].after, vec!["a6"]);
	}

	#[test]
	fn context_does_not_cross_file_boundaries() {
		let matches = content(normalize(sample_events(), OutputMode::Content));
		assert_eq!(matches[2].file, "b.rs");
		assert_eq!(matches[2].before, vec!["b0"]);
		assert!(matches[2].after.is_empty());
		assert!(matches[4].before.is_empty());
		assert!(matches[4].after.is_empty());
	}

	#[test]
	fn trailing_context_flushes_at_end_of_stream() {
		let matches = content(normalize(vec![hit("x", 1, "m"), ctx("tail")], OutputMode::Content));
		assert_eq!(matches[0].after, vec!["tail"]);
	}

	#[test]
	fn files_are_deduplicated_in_discovery_order() {
		let projection = normalize(sample_events(), OutputMode::FilesWithMatches);
		assert_eq!(projection, SearchProjection::FilesWithMatches {
			files: vec!["a.rs".to_string(), "b.rs".to_string(), "c.rs".to_string()]
		});
	}

	#[test]
	fn counts_agree_with_content_matches() {
		let matches = content(normalize(sample_events(), OutputMode::Content));
		let SearchProjection::Count { counts } = normalize(sample_events(), OutputMode::Count) else {
			panic!("expected count projection");
		};
		assert_eq!(counts.iter().map(|c| c.file.as_str()).collect::<Vec<_>>(), vec!["a.rs", "b.rs", "c.rs"]);
		for entry in counts {
			let expected = matches.iter().filter(|m| m.file == entry.file).count();
			assert_eq!(entry.count, expected, "count for {}", entry.file);
		}
	}

	#[test]
	fn pages_concatenate_to_the_full_result() {
		let full = paginate(normalize(sample_events(), OutputMode::Content), None, None);
		let first = paginate(normalize(sample_events(), OutputMode::Content), None, Some(1));
		let rest = paginate(normalize(sample_events(), OutputMode::Content), Some(1), None);
		assert_eq!(first.total, 5);
		assert!(first.has_more);
		assert!(!rest.has_more);
		let mut joined = content(first.projection);
		joined.extend(content(rest.projection));
		assert_eq!(joined, content(full.projection));
	}

	#[test]
	fn offset_past_end_is_empty() {
		let page = paginate(normalize(sample_events(), OutputMode::Count), Some(50), Some(10));
		assert_eq!(page.total, 3);
		assert_eq!(page.returned, 0);
		assert!(!page.has_more);
		let value = serde_json::to_value(&page).expect("serialize");
		assert_eq!(value["mode"], "count");
		assert_eq!(value["counts"], serde_json::json!([]));
	}

	#[test]
	fn parses_rg_json_lines() {
		let root = PathBuf::from("/srv/ws");
		let begin = r#"{"type":"begin","data":{"path":{"text":"./src/a.rs"}}}"#;
		let matched = r#"{"type":"match","data":{"path":{"text":"./src/a.rs"},"lines":{"text":"fn main() {\n"},"line_number":1,"absolute_offset":0,"submatches":[{"match":{"text":"main"},"start":3,"end":7}]}}"#;
		let context = r#"{"type":"context","data":{"path":{"text":"./src/a.rs"},"lines":{"text":"}\r\n"},"line_number":2,"absolute_offset":12,"submatches":[]}}"#;
		let absolute = r#"{"type":"match","data":{"path":{"text":"/srv/ws/lib/b.rs"},"lines":{"text":"x\n"},"line_number":7,"absolute_offset":0,"submatches":[]}}"#;
		let binary = r#"{"type":"match","data":{"path":{"text":"c.bin"},"lines":{"bytes":"AAE="},"line_number":1,"absolute_offset":0,"submatches":[]}}"#;
		let summary = r#"{"type":"summary","data":{"elapsed_total":{"secs":0,"nanos":1,"human":"0s"},"stats":{}}}"#;
		assert_eq!(parse_rg_event(begin, &root).expect("begin"), Some(MatchEvent::FileBoundary));
		assert_eq!(parse_rg_event(matched, &root).expect("match"), Some(hit("src/a.rs", 1, "fn main() {")));
		assert_eq!(parse_rg_event(context, &root).expect("context"), Some(ctx("}")));
		assert_eq!(parse_rg_event(absolute, &root).expect("absolute"), Some(hit("lib/b.rs", 7, "x")));
		assert_eq!(parse_rg_event(binary, &root).expect("binary"), None);
		assert_eq!(parse_rg_event(summary, &root).expect("summary"), None);
		assert!(parse_rg_event("{not json", &root).is_err());
	}

	#[test]
	fn arguments_are_discrete_tokens() {
		let request = SearchRequest {
			pattern: "-rf; echo $(id)".to_string(),
			path: None,
			globs: vec!["*.rs".to_string()],
			mode: OutputMode::Count,
			context_lines: Some(2),
			case_insensitive: true,
			offset: None,
			limit: None
		};
		let args = rg_args(&request, ".");
		assert!(!args.contains(&"-C".to_string()));
		let sort_at = args.iter().position(|arg| arg == "--sort").expect("sort flag");
		assert_eq!(args[sort_at + 1], "path");
		let pattern_at = args.iter().position(|arg| arg == "--regexp").expect("regexp flag");
		assert_eq!(args[pattern_at + 1], "-rf; echo $(id)");
		assert_eq!(&args[args.len() - 2..], &["--".to_string(), ".".to_string()]);
	}

	fn rg_available() -> bool {
		std::process::Command::new("rg")
			.arg("--version")
			.output()
			.map(|output| output.status.success())
			.unwrap_or(false)
	}

	#[tokio::test]
	async fn searches_workspace_with_ripgrep() {
		if !rg_available() {
			return;
		}
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::create_dir_all(dir.path().join("src")).expect("mkdir");
		std::fs::write(dir.path().join("src/a.rs"), "one\nneedle\nthree\nneedle\n").expect("write");
		std::fs::write(dir.path().join("src/b.rs"), "needle\n").expect("write");
		let ws = Workspace {
			key: "test".to_string(),
			name: "test".to_string(),
			root: dir.path().to_path_buf(),
			allowlist: Allowlist::new(&[]).expect("allowlist")
		};
		let settings = SearchSettings {
			rg_path: "rg".to_string(),
			max_output_bytes: 1024 * 1024
		};
		let mut request = SearchRequest {
			pattern: "needle".to_string(),
			path: Some("/src".to_string()),
			globs: Vec::new(),
			mode: OutputMode::Count,
			context_lines: None,
			case_insensitive: false,
			offset: None,
			limit: None
		};
		let result = search(&ws, &request, &settings).await.expect("search");
		let SearchProjection::Count { counts } = result.page.projection else {
			panic!("expected counts");
		};
		assert_eq!(counts, vec![
			FileCount {
				file: "src/a.rs".to_string(),
				count: 2
			},
			FileCount {
				file: "src/b.rs".to_string(),
				count: 1
			},
		]);
		request.pattern = "absent-token".to_string();
		let empty = search(&ws, &request, &settings).await.expect("no matches is not an error");
		assert_eq!(empty.page.total, 0);
		request.path = Some("../".to_string());
		let escape = search(&ws, &request, &settings).await.expect_err("escape");
		assert_eq!(escape.code(), "PATH_ESCAPE");
	}

	#[tokio::test]
	async fn bounded_read_stops_at_limit() {
		let data = b"0123456789abcdef";
		let (under, cut) = read_bounded(&data[..], 64).await.expect("read");
		assert_eq!(under, data.to_vec());
		assert!(!cut);
		let (exact, cut) = read_bounded(&data[..], 16).await.expect("read");
		assert_eq!(exact.len(), 16);
		assert!(!cut);
		let (over, cut) = read_bounded(&data[..], 10).await.expect("read");
		assert_eq!(over, b"0123456789".to_vec());
		assert!(cut);
	}

	#[tokio::test]
	async fn oversized_rg_output_is_truncated() {
		if !rg_available() {
			return;
		}
		let dir = tempfile::tempdir().expect("tempdir");
		let body: String = (0..500).map(|n| format!("needle line {n}\n")).collect();
		std::fs::write(dir.path().join("big.txt"), body).expect("write");
		let ws = Workspace {
			key: "test".to_string(),
			name: "test".to_string(),
			root: dir.path().to_path_buf(),
			allowlist: Allowlist::new(&[]).expect("allowlist")
		};
		let settings = SearchSettings {
			rg_path: "rg".to_string(),
			max_output_bytes: 400
		};
		let request = SearchRequest {
			pattern: "needle".to_string(),
			path: None,
			globs: Vec::new(),
			mode: OutputMode::Content,
			context_lines: None,
			case_insensitive: false,
			offset: None,
			limit: None
		};
		let result = search(&ws, &request, &settings).await.expect("partial output still parses");
		assert!(result.output_truncated);
		assert!(result.page.total < 500);
		let full = SearchSettings {
			rg_path: "rg".to_string(),
			max_output_bytes: 1024 * 1024
		};
		let complete = search(&ws, &request, &full).await.expect("search");
		assert!(!complete.output_truncated);
		assert_eq!(complete.page.total, 500);
	}
}
