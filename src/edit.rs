use crate::error::ToolError;
use crate::fs;
use crate::workspace::Workspace;
use regex::Regex;
use serde::Serialize;
use similar::TextDiff;
use tracing::info;

#[derive(Clone, Debug)]
pub struct EditSpec {
	pub old_pattern: String,
	pub new_pattern: String,
	pub replace_all: bool,
	pub use_regex: bool,
}

impl EditSpec {
	fn compile(&self) -> Result<Matcher<'_>, ToolError> {
		if self.old_pattern.is_empty() {
			return Err(ToolError::invalid("old_string must not be empty"));
		}
		if !self.use_regex {
			return Ok(Matcher::Literal(&self.old_pattern));
		}
		Regex::new(&self.old_pattern)
			.map(Matcher::Pattern)
			.map_err(|err| ToolError::InvalidPattern(err.to_string()))
	}
}

/// Literal text is plain substring search; only regex mode compiles a pattern.
enum Matcher<'a> {
	Literal(&'a str),
	Pattern(Regex),
}

impl Matcher<'_> {
	/// First match (offset and text) plus the number of non-overlapping matches.
	fn locate<'c>(&self, content: &'c str) -> (Option<(usize, &'c str)>, usize) {
		match self {
			Matcher::Literal(needle) => {
				let mut found = content.match_indices(*needle);
				let first = found.next();
				let count = first.map(|_| 1 + found.count()).unwrap_or(0);
				(first, count)
			}
			Matcher::Pattern(re) => {
				let mut found = re.find_iter(content);
				let first = found.next().map(|m| (m.start(), m.as_str()));
				let count = first.map(|_| 1 + found.count()).unwrap_or(0);
				(first, count)
			}
		}
	}

	fn substitute(&self, content: &str, replacement: &str) -> String {
		match self {
			Matcher::Literal(needle) => content.replace(*needle, replacement),
			Matcher::Pattern(re) => re.replace_all(content, replacement).into_owned(),
		}
	}

	fn first_replacement(&self, content: &str, replacement: &str) -> String {
		match self {
			Matcher::Literal(_) => replacement.to_string(),
			Matcher::Pattern(re) => {
				let mut expanded = String::new();
				if let Some(caps) = re.captures(content) {
					caps.expand(replacement, &mut expanded);
				}
				expanded
			}
		}
	}
}

#[derive(Clone, Debug)]
pub struct EditOptions {
	pub apply: bool,
	/// Lines of context around the first change; `None` skips the preview.
	pub preview_context: Option<usize>,
}

impl Default for EditOptions {
	fn default() -> Self {
		Self {
			apply: true,
			preview_context: Some(3)
		}
	}
}

#[derive(Debug, Serialize)]
pub struct EditPreview {
	pub start_line: usize,
	pub before: String,
	pub after: String,
}

#[derive(Debug, Serialize)]
pub struct EditSuccess {
	pub path: String,
	pub occurrences: usize,
	pub line_delta: i64,
	pub applied: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub preview: Option<EditPreview>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub diff: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EditOutcome {
	Applied(EditSuccess),
	Failed {
		path: String,
		error: ToolError
	},
}

impl EditOutcome {
	pub fn is_applied(&self) -> bool {
		matches!(self, EditOutcome::Applied(_))
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
	Complete,
	Partial,
	Failed,
}

#[derive(Debug, Serialize)]
pub struct BatchEditResult {
	pub total_files: usize,
	pub succeeded: usize,
	pub failed: usize,
	pub status: BatchStatus,
	pub outcomes: Vec<EditOutcome>,
}

pub async fn edit(workspace: &Workspace, raw_path: &str, spec: &EditSpec, options: &EditOptions) -> EditOutcome {
	match edit_file(workspace, raw_path, spec, options).await {
		Ok(success) => EditOutcome::Applied(success),
		Err(error) => EditOutcome::Failed {
			path: raw_path.to_string(),
			error
		},
	}
}

async fn edit_file(workspace: &Workspace, raw_path: &str, spec: &EditSpec, options: &EditOptions) -> Result<EditSuccess, ToolError> {
	let target = workspace.resolve_writable(raw_path)?;
	let matcher = spec.compile()?;
	let original = tokio::fs::read_to_string(&target.absolute).await.map_err(|err| ToolError::io("read", &target.rel, &err))?;
	let (first, occurrences) = matcher.locate(&original);
	let (first_start, first_text) = first.ok_or_else(|| ToolError::not_found(&target.rel, &spec.old_pattern))?;
	if occurrences > 1 && !spec.replace_all {
		return Err(ToolError::NotUnique {
			path: target.rel.clone(),
			count: occurrences
		});
	}
	let edited = matcher.substitute(&original, &spec.new_pattern);
	let preview = options.preview_context.map(|context| {
		let replacement = matcher.first_replacement(&original, &spec.new_pattern);
		build_preview(
			&original,
			&edited,
			first_start,
			first_text,
			&replacement,
			context
		)
	});
	let line_delta = edited.lines().count() as i64 - original.lines().count() as i64;
	let diff = if options.apply {
		fs::write_atomic(&target.absolute, &edited).await.map_err(|err| ToolError::io("write", &target.rel, &err))?;
		info!(
			workspace = %workspace.key,
			path = %target.rel,
			occurrences,
			line_delta,
			"applied edit"
		);
		None
	}
	else {
		Some(unified_diff(&original, &edited, &target.rel))
	};
	Ok(EditSuccess {
		path: target.rel,
		occurrences,
		line_delta,
		applied: options.apply,
		preview,
		diff
	})
}

/// Applies `spec` to every path in order; failures are recorded per file and never stop the batch.
pub async fn edit_many(workspace: &Workspace, paths: &[String], spec: &EditSpec, options: &EditOptions) -> BatchEditResult {
	let mut outcomes = Vec::with_capacity(paths.len());
	for path in paths {
		outcomes.push(edit(workspace, path, spec, options).await);
	}
	let succeeded = outcomes.iter()
		.filter(|outcome| outcome.is_applied())
		.count();
	let failed = outcomes.len() - succeeded;
	let status = if failed == 0 {
		BatchStatus::Complete
	}
	else if succeeded == 0 {
		BatchStatus::Failed
	}
	else {
		BatchStatus::Partial
	};
	BatchEditResult {
		total_files: outcomes.len(),
		succeeded,
		failed,
		status,
		outcomes
	}
}

fn build_preview(
	original: &str,
	edited: &str,
	start: usize,
	matched: &str,
	replacement: &str,
	context: usize) -> EditPreview {
	let start_line = original[..start].matches('\n').count() + 1;
	EditPreview {
		start_line,
		before: render_window(original, start_line, span_lines(matched), context),
		after: render_window(edited, start_line, span_lines(replacement), context)
	}
}

fn span_lines(text: &str) -> usize {
	text.trim_end_matches('\n').matches('\n').count() + 1
}

fn render_window(content: &str, first_line: usize, span: usize, context: usize) -> String {
	let lines: Vec<&str> = content.lines().collect();
	if lines.is_empty() {
		return String::new();
	}
	let end = (first_line + span - 1 + context).min(lines.len());
	let start = first_line.saturating_sub(context).max(1).min(end);
	let width = end.to_string().len();
	(start..=end).map(|number| format!("{:>width$}: {}", number, lines[number - 1], width = width))
		.collect::<Vec<_>>()
		.join("\n")
}

pub fn unified_diff(existing: &str, updated: &str, rel_path: &str) -> String {
	let diff = TextDiff::from_lines(existing, updated);
	diff.unified_diff()
		.context_radius(3)
		.header(&format!("a/{}", rel_path), &format!("b/{}", rel_path))
		.to_string()
}
