//! Exclude pattern matching
//!
//! A pattern suppresses discovery when it equals the root-relative path,
//! equals any single path component, or (containing `*`) glob-matches the
//! relative path or any component. Matching is case-sensitive and happens
//! before any store write, so excluded paths never touch the file table.

use globset::{Glob, GlobMatcher};
use std::path::Path;
use tracing::warn;

enum Rule {
	Literal(String),
	Glob(GlobMatcher),
}

pub struct ExcludeSet {
	rules: Vec<Rule>,
}

impl ExcludeSet {
	pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
		let rules = patterns
			.into_iter()
			.filter(|p| !p.is_empty())
			.map(|pattern| {
				if pattern.contains('*') {
					match Glob::new(&pattern) {
						Ok(glob) => Rule::Glob(glob.compile_matcher()),
						Err(e) => {
							warn!("Invalid exclude glob {:?}: {}", pattern, e);
							Rule::Literal(pattern)
						}
					}
				} else {
					Rule::Literal(pattern)
				}
			})
			.collect();
		Self { rules }
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	/// `relative` is the candidate path relative to its root.
	pub fn matches(&self, relative: &Path) -> bool {
		if self.rules.is_empty() {
			return false;
		}
		let rel_str = relative.to_string_lossy();
		let components: Vec<&str> = rel_str.split('/').filter(|c| !c.is_empty()).collect();

		self.rules.iter().any(|rule| match rule {
			Rule::Literal(p) => p == rel_str.as_ref() || components.iter().any(|c| c == p),
			Rule::Glob(g) => {
				g.is_match(rel_str.as_ref()) || components.iter().any(|c| g.is_match(c))
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn set(patterns: &[&str]) -> ExcludeSet {
		ExcludeSet::new(patterns.iter().map(|s| s.to_string()))
	}

	#[test]
	fn literal_matches_relative_path_or_component() {
		let excludes = set(&["node_modules", "build/output.bin"]);
		assert!(excludes.matches(Path::new("node_modules")));
		assert!(excludes.matches(Path::new("web/node_modules/left-pad/index.js")));
		assert!(excludes.matches(Path::new("build/output.bin")));
		assert!(!excludes.matches(Path::new("output.bin")));
		assert!(!excludes.matches(Path::new("src/main.rs")));
	}

	#[test]
	fn glob_matches_path_and_components() {
		let excludes = set(&["*.log"]);
		assert!(excludes.matches(Path::new("x.log")));
		assert!(excludes.matches(Path::new("deep/dir/y.log")));
		assert!(!excludes.matches(Path::new("y.txt")));
		assert!(!excludes.matches(Path::new("log/data.txt")));
	}

	#[test]
	fn matching_is_case_sensitive() {
		let excludes = set(&["Cache"]);
		assert!(excludes.matches(Path::new("Cache/blob")));
		assert!(!excludes.matches(Path::new("cache/blob")));
	}

	#[test]
	fn empty_patterns_are_dropped() {
		let excludes = set(&[]);
		assert!(excludes.is_empty());
		assert!(!excludes.matches(Path::new("anything")));
	}
}
