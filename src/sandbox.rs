use crate::error::ToolError;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Resolves a caller path against `root`. `""`, `"/"` and `"."` name the root itself
/// and one leading separator is treated as root-relative. Lexical only; no I/O.
pub fn resolve(root: &Path, raw: &str) -> Result<PathBuf, ToolError> {
	let trimmed = raw.trim();
	if is_root_alias(trimmed) {
		return Ok(root.to_path_buf());
	}
	let rel = trimmed.strip_prefix('/').unwrap_or(trimmed);
	let normalized = normalize_path(&root.join(rel));
	if normalized == root || normalized.starts_with(root) {
		return Ok(normalized);
	}
	Err(ToolError::PathEscape {
		path: raw.to_string()
	})
}

fn is_root_alias(raw: &str) -> bool {
	matches!(raw, "" | "/" | ".")
}

pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<OsString> = Vec::new();
	let mut prefix: Option<OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if !stack.is_empty() && stack.last().map(|part| part != "..").unwrap_or(false) {
					stack.pop();
				}
				else if !absolute {
					stack.push(OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new("/"));
	}
	for part in stack {
		out.push(part);
	}
	out
}

/// Root-relative, `/`-separated form of a resolved path. Empty for the root itself.
pub fn relative_to_root(root: &Path, path: &Path) -> String {
	let Ok(rel) = path.strip_prefix(root) else {
		return path.to_string_lossy().to_string();
	};
	rel.components()
		.map(|component| component.as_os_str().to_string_lossy())
		.collect::<Vec<_>>()
		.join("/")
}

pub fn display_relative(rel: &str) -> &str {
	if rel.is_empty() {
		"."
	}
	else {
		rel
	}
}
