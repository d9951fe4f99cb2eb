use crate::error::ToolError;
use crate::sandbox;
use crate::workspace::Workspace;
use ignore::WalkBuilder;
use serde::Serialize;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct ReadLimits {
	pub max_file_bytes: u64,
	pub default_limit: usize,
	pub max_line_bytes: usize,
}

impl Default for ReadLimits {
	fn default() -> Self {
		Self {
			max_file_bytes: 5 * 1024 * 1024,
			default_limit: 500,
			max_line_bytes: 25 * 1024
		}
	}
}

#[derive(Debug, Serialize)]
pub struct ReadResult {
	pub path: String,
	pub content: String,
	pub total_lines: usize,
	pub start_line: usize,
	pub end_line: usize,
	pub truncated: bool,
	pub long_lines: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<&'static str>,
}

pub async fn read_file(
	workspace: &Workspace,
	raw_path: &str,
	offset: Option<usize>,
	limit: Option<usize>,
	limits: &ReadLimits) -> Result<ReadResult, ToolError> {
	let target = workspace.resolve(raw_path)?;
	let rel = sandbox::display_relative(&target.rel).to_string();
	let meta = fs::metadata(&target.absolute).await.map_err(|err| ToolError::io("read", &rel, &err))?;
	if meta.is_dir() {
		return Err(ToolError::invalid(format!("{} is a directory; use list_directory", rel)));
	}
	if meta.len() > limits.max_file_bytes {
		return Err(ToolError::SizeLimitExceeded {
			path: rel,
			size: meta.len(),
			limit: limits.max_file_bytes
		});
	}
	let bytes = fs::read(&target.absolute).await.map_err(|err| ToolError::io("read", &rel, &err))?;
	let content = String::from_utf8_lossy(&bytes);
	Ok(paginate_lines(rel, &content, offset, limit, limits))
}

fn paginate_lines(
	path: String,
	content: &str,
	offset: Option<usize>,
	limit: Option<usize>,
	limits: &ReadLimits) -> ReadResult {
	let lines: Vec<&str> = content.lines().collect();
	let total = lines.len();
	let start_line = offset.unwrap_or(1).max(1);
	let window = match limit {
		Some(0) => usize::MAX,
		Some(value) => value,
		None => limits.default_limit,
	};
	let start_index = (start_line - 1).min(total);
	let end_index = start_index.saturating_add(window).min(total);
	let width = end_index.to_string().len();
	let mut long_lines = false;
	let mut out = Vec::with_capacity(end_index - start_index);
	for (index, line) in lines[start_index..end_index].iter().enumerate() {
		let number = start_index + index + 1;
		let text = if line.len() > limits.max_line_bytes {
			long_lines = true;
			let (kept, kept_bytes) = truncate_to_bytes(line, limits.max_line_bytes);
			format!("{} [TRUNCATED: {} bytes hidden]", kept, line.len() - kept_bytes)
		}
		else {
			line.to_string()
		};
		out.push(format!("{:>width$}: {}", number, text, width = width));
	}
	let code = if out.is_empty() && start_line > total && total > 0 {
		Some("EMPTY_RANGE")
	}
	else {
		None
	};
	ReadResult {
		path,
		content: out.join("\n"),
		total_lines: total,
		start_line,
		end_line: end_index,
		truncated: end_index < total && limit.is_none(),
		long_lines,
		code
	}
}

fn truncate_to_bytes(input: &str, max_bytes: usize) -> (&str, usize) {
	let mut end = 0usize;
	for (idx, ch) in input.char_indices() {
		let next = idx + ch.len_utf8();
		if next > max_bytes {
			break;
		}
		end = next;
	}
	(&input[..end], end)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
	Overwrite,
	Append,
	Prepend,
}

impl WriteMode {
	pub fn parse(value: Option<&str>) -> Result<Self, ToolError> {
		match value.unwrap_or("overwrite") {
			"overwrite" => Ok(WriteMode::Overwrite),
			"append" => Ok(WriteMode::Append),
			"prepend" => Ok(WriteMode::Prepend),
			other => Err(ToolError::invalid(format!("mode must be overwrite, append, or prepend (got {})", other))),
		}
	}

	fn as_str(self) -> &'static str {
		match self {
			WriteMode::Overwrite => "overwrite",
			WriteMode::Append => "append",
			WriteMode::Prepend => "prepend",
		}
	}
}

#[derive(Debug, Serialize)]
pub struct WriteResult {
	pub path: String,
	pub mode: &'static str,
	pub bytes_written: usize,
	pub created: bool,
	pub overwrote_existing: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub previous_bytes: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub warning: Option<String>,
}

pub async fn write_file(workspace: &Workspace, raw_path: &str, content: &str, mode: WriteMode) -> Result<WriteResult, ToolError> {
	let target = workspace.resolve_writable(raw_path)?;
	let previous_bytes = match fs::metadata(&target.absolute).await {
		Ok(meta) if meta.is_dir() => {
			return Err(ToolError::invalid(format!("{} is a directory", target.rel)));
		}
		Ok(meta) => Some(meta.len()),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
		Err(err) => return Err(ToolError::io("stat", &target.rel, &err)),
	};
	let next = match mode {
		WriteMode::Overwrite => content.to_string(),
		WriteMode::Append | WriteMode::Prepend => {
			let existing = if previous_bytes.is_some() {
				fs::read_to_string(&target.absolute).await.map_err(|err| ToolError::io("read", &target.rel, &err))?
			}
			else {
				String::new()
			};
			if mode == WriteMode::Append {
				join_with_newline(&existing, content)
			}
			else {
				join_with_newline(content, &existing)
			}
		}
	};
	if let Some(parent) = target.absolute.parent() {
		fs::create_dir_all(parent).await.map_err(|err| ToolError::io("create directory for", &target.rel, &err))?;
	}
	write_atomic(&target.absolute, &next).await.map_err(|err| ToolError::io("write", &target.rel, &err))?;
	let overwrote_existing = mode == WriteMode::Overwrite && previous_bytes.map(|len| len > 0).unwrap_or(false);
	let warning = if overwrote_existing {
		warn!(
			workspace = %workspace.key,
			path = %target.rel,
			previous_bytes = previous_bytes.unwrap_or(0),
			"overwrote non-empty file"
		);
		Some(format!(
			"overwrote existing non-empty file ({} bytes); use edit_file for targeted changes",
			previous_bytes.unwrap_or(0)
		))
	}
	else {
		info!(workspace = %workspace.key, path = %target.rel, mode = mode.as_str(), "wrote file");
		None
	};
	Ok(WriteResult {
		path: target.rel,
		mode: mode.as_str(),
		bytes_written: next.len(),
		created: previous_bytes.is_none(),
		overwrote_existing,
		previous_bytes: if overwrote_existing {
			previous_bytes
		}
		else {
			None
		},
		warning
	})
}

fn join_with_newline(head: &str, tail: &str) -> String {
	if head.is_empty() || tail.is_empty() || head.ends_with('\n') || tail.starts_with('\n') {
		format!("{}{}", head, tail)
	}
	else {
		format!("{}\n{}", head, tail)
	}
}

/// Writes through a sibling temp file and renames it over `path`, keeping the original permissions.
pub async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
	let parent = path.parent().unwrap_or_else(|| Path::new("."));
	let file_name = path.file_name()
		.map(|name| name.to_string_lossy().to_string())
		.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"))?;
	let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
	let permissions = fs::metadata(path).await.ok().map(|meta| meta.permissions());
	let staged = async {
		fs::write(&tmp, content).await?;
		if let Some(permissions) = permissions {
			fs::set_permissions(&tmp, permissions).await?;
		}
		fs::rename(&tmp, path).await
	}.await;
	if staged.is_err() {
		let _ = fs::remove_file(&tmp).await;
	}
	staged
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
	File,
	Dir,
	Symlink,
}

#[derive(Debug, Serialize)]
pub struct ListEntry {
	pub path: String,
	pub kind: EntryKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ListResult {
	pub path: String,
	pub entries: Vec<ListEntry>,
	pub count: usize,
	pub truncated: bool,
}

pub async fn list_directory(
	workspace: &Workspace,
	raw_path: Option<&str>,
	recursive: bool,
	max_depth: Option<usize>,
	max_entries: usize) -> Result<ListResult, ToolError> {
	let target = workspace.resolve(raw_path.unwrap_or(""))?;
	let rel = sandbox::display_relative(&target.rel).to_string();
	let meta = fs::metadata(&target.absolute).await.map_err(|err| ToolError::io("list", &rel, &err))?;
	if !meta.is_dir() {
		return Err(ToolError::invalid(format!("{} is not a directory", rel)));
	}
	let depth = if recursive {
		max_depth
	}
	else {
		Some(1)
	};
	let mut builder = WalkBuilder::new(&target.absolute);
	builder.hidden(true);
	builder.max_depth(depth);
	builder.sort_by_file_name(|a, b| a.cmp(b));
	let mut entries = Vec::new();
	let mut truncated = false;
	for entry in builder.build() {
		let Ok(entry) = entry else {
			continue;
		};
		if entry.depth() == 0 {
			continue;
		}
		if entries.len() >= max_entries {
			truncated = true;
			break;
		}
		let Some(file_type) = entry.file_type() else {
			continue;
		};
		let kind = if file_type.is_symlink() {
			EntryKind::Symlink
		}
		else if file_type.is_dir() {
			EntryKind::Dir
		}
		else {
			EntryKind::File
		};
		let size = match kind {
			EntryKind::File => entry.metadata().ok().map(|meta| meta.len()),
			_ => None,
		};
		entries.push(ListEntry {
			path: sandbox::relative_to_root(&workspace.root, entry.path()),
			kind,
			size
		});
	}
	let count = entries.len();
	Ok(ListResult {
		path: rel,
		entries,
		count,
		truncated
	})
}
