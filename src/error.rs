use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

const EXCERPT_CHARS: usize = 100;

#[derive(Debug, Error)]
pub enum ToolError {
	#[error("path escapes workspace root: {path}")]
	PathEscape {
		path: String
	},
	#[error("{path} is not in the write allowlist of workspace {workspace}")]
	AllowlistRejection {
		workspace: String,
		path: String
	},
	#[error("old_string not found in {path}: {excerpt}")]
	NotFound {
		path: String,
		excerpt: String
	},
	#[error("found {count} occurrences of old_string in {path}; pass replace_all=true or add surrounding context to make it unique")]
	NotUnique {
		path: String,
		count: usize
	},
	#[error("invalid pattern: {0}")]
	InvalidPattern(String),
	#[error("{path} is {size} bytes, over the {limit} byte read limit; read a smaller range with offset/limit or use search_files instead")]
	SizeLimitExceeded {
		path: String,
		size: u64,
		limit: u64
	},
	#[error("{action} {path}: {reason}")]
	Io {
		action: &'static str,
		path: String,
		reason: String
	},
	#[error("unknown workspace: {0}")]
	UnknownWorkspace(String),
	#[error("{0}")]
	InvalidArgument(String),
}

impl ToolError {
	pub fn code(&self) -> &'static str {
		match self {
			ToolError::PathEscape { .. } => "PATH_ESCAPE",
			ToolError::AllowlistRejection { .. } => "NOT_ALLOWLISTED",
			ToolError::NotFound { .. } => "NOT_FOUND",
			ToolError::NotUnique { .. } => "NOT_UNIQUE",
			ToolError::InvalidPattern(_) => "INVALID_PATTERN",
			ToolError::SizeLimitExceeded { .. } => "SIZE_LIMIT_EXCEEDED",
			ToolError::Io { .. } => "IO_FAILURE",
			ToolError::UnknownWorkspace(_) => "UNKNOWN_WORKSPACE",
			ToolError::InvalidArgument(_) => "INVALID_ARGUMENT",
		}
	}

	pub fn not_found(path: &str, sought: &str) -> Self {
		ToolError::NotFound {
			path: path.to_string(),
			excerpt: excerpt(sought)
		}
	}

	pub fn io(action: &'static str, path: &str, err: &std::io::Error) -> Self {
		let reason = match err.kind() {
			std::io::ErrorKind::NotFound => "not found".to_string(),
			std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
			std::io::ErrorKind::InvalidInput => "invalid input".to_string(),
			std::io::ErrorKind::IsADirectory => "is a directory".to_string(),
			_ => err.to_string(),
		};
		ToolError::Io {
			action,
			path: path.to_string(),
			reason
		}
	}

	pub fn invalid(message: impl Into<String>) -> Self {
		ToolError::InvalidArgument(message.into())
	}
}

impl Serialize for ToolError {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(None)?;
		map.serialize_entry("code", self.code())?;
		map.serialize_entry("message", &self.to_string())?;
		if let ToolError::NotUnique { count, .. } = self {
			map.serialize_entry("count", count)?;
		}
		map.end()
	}
}

fn excerpt(text: &str) -> String {
	let mut chars = text.chars();
	let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
	if chars.next().is_some() {
		format!("{}...", head)
	}
	else {
		head
	}
}
