use anyhow::{anyhow, Result};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

#[derive(Clone, Debug)]
pub struct Allowlist {
	patterns: Vec<String>,
	set: GlobSet,
}

impl Allowlist {
	pub fn new(patterns: &[String]) -> Result<Self> {
		let mut builder = GlobSetBuilder::new();
		for pattern in patterns {
			let glob = build_glob(pattern).map_err(|err| anyhow!("invalid glob {}: {}", pattern, err))?;
			builder.add(glob);
		}
		let set = builder.build().map_err(|err| anyhow!("invalid glob set: {}", err))?;
		Ok(Self {
			patterns: patterns.to_vec(),
			set
		})
	}

	pub fn patterns(&self) -> &[String] {
		&self.patterns
	}

	/// `rel` is the root-relative `/`-separated path. The root itself never matches.
	pub fn is_allowed(&self, rel: &str) -> bool {
		if rel.is_empty() {
			return false;
		}
		self.set.is_match(rel)
	}
}

fn build_glob(pattern: &str) -> std::result::Result<Glob, globset::Error> {
	GlobBuilder::new(pattern)
		.literal_separator(true)
		.case_insensitive(false)
		.backslash_escape(true)
		.build()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn patterns(items: &[&str]) -> Vec<String> {
		items.iter().map(|item| item.to_string()).collect()
	}

	fn is_allowed(path: &str, list: &[String]) -> bool {
		Allowlist::new(list).expect("build").is_allowed(path)
	}

	#[test]
	fn empty_allowlist_rejects_everything() {
		let allowlist = Allowlist::new(&[]).expect("build");
		assert!(!allowlist.is_allowed("a.txt"));
		assert!(allowlist.patterns().is_empty());
	}

	#[test]
	fn single_star_stays_within_a_segment() {
		let allowlist = Allowlist::new(&patterns(&["src/*.rs"])).expect("build");
		assert!(allowlist.is_allowed("src/main.rs"));
		assert!(!allowlist.is_allowed("src/nested/lib.rs"));
		assert!(!allowlist.is_allowed("other/src/main.rs"));
	}

	#[test]
	fn double_star_spans_zero_or_more_segments() {
		let allowlist = Allowlist::new(&patterns(&["Sources/**/*.swift"])).expect("build");
		assert!(allowlist.is_allowed("Sources/App.swift"));
		assert!(allowlist.is_allowed("Sources/Modules/Deep/View.swift"));
		assert!(!allowlist.is_allowed("Tests/App.swift"));
		let everything = Allowlist::new(&patterns(&["**"])).expect("build");
		assert!(everything.is_allowed("any/depth/file"));
	}

	#[test]
	fn question_mark_matches_one_character() {
		assert!(is_allowed("log1.txt", &patterns(&["log?.txt"])));
		assert!(!is_allowed("log12.txt", &patterns(&["log?.txt"])));
		assert!(!is_allowed("log/.txt", &patterns(&["log?.txt"])));
	}

	#[test]
	fn matching_is_anchored_and_case_sensitive() {
		let list = patterns(&["docs/*.md"]);
		assert!(!is_allowed("docs/README.md.bak", &list));
		assert!(!is_allowed("x/docs/README.md", &list));
		assert!(!is_allowed("Docs/README.md", &list));
		assert!(is_allowed("docs/README.md", &list));
	}

	#[test]
	fn any_pattern_suffices() {
		let list = patterns(&["a/*", "b/**"]);
		assert!(is_allowed("b/c/d", &list));
		assert!(is_allowed("a/x", &list));
		assert!(!is_allowed("c/x", &list));
	}

	#[test]
	fn root_is_never_writable() {
		let allowlist = Allowlist::new(&patterns(&["**"])).expect("build");
		assert!(!allowlist.is_allowed(""));
	}

	#[test]
	fn invalid_pattern_fails_compilation() {
		let err = Allowlist::new(&patterns(&["src/[a"])).expect_err("unclosed class");
		assert!(err.to_string().contains("src/[a"));
	}
}
