use crate::allowlist::Allowlist;
use crate::error::ToolError;
use crate::sandbox;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Workspace {
	pub key: String,
	pub name: String,
	pub root: PathBuf,
	pub allowlist: Allowlist,
}

#[derive(Debug)]
pub struct Target {
	pub absolute: PathBuf,
	pub rel: String,
}

impl Workspace {
	pub fn resolve(&self, raw: &str) -> Result<Target, ToolError> {
		let absolute = sandbox::resolve(&self.root, raw)?;
		let rel = sandbox::relative_to_root(&self.root, &absolute);
		Ok(Target {
			absolute,
			rel
		})
	}

	pub fn resolve_writable(&self, raw: &str) -> Result<Target, ToolError> {
		let target = self.resolve(raw)?;
		if !self.allowlist.is_allowed(&target.rel) {
			return Err(ToolError::AllowlistRejection {
				workspace: self.key.clone(),
				path: sandbox::display_relative(&target.rel).to_string()
			});
		}
		Ok(target)
	}

	pub fn describe(&self) -> Value {
		json!({
			"workspace": self.key,
			"name": self.name,
			"root": self.root.display().to_string(),
			"write_allowlist": self.allowlist.patterns(),
		})
	}
}

#[derive(Clone, Debug, Default)]
pub struct Workspaces {
	map: BTreeMap<String, Workspace>,
}

impl Workspaces {
	pub fn new(workspaces: Vec<Workspace>) -> Self {
		let map = workspaces.into_iter()
			.map(|workspace| (workspace.key.clone(), workspace))
			.collect();
		Self {
			map
		}
	}

	pub fn len(&self) -> usize {
		self.map.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Workspace> {
		self.map.values()
	}

	/// An omitted name picks the only configured workspace, if there is exactly one.
	pub fn get(&self, name: Option<&str>) -> Result<&Workspace, ToolError> {
		match name {
			Some(name) => self.map
				.get(name)
				.ok_or_else(|| ToolError::UnknownWorkspace(name.to_string())),
			None => {
				if self.map.len() == 1 {
					if let Some(workspace) = self.map.values().next() {
						return Ok(workspace);
					}
				}
				let known = self.map
					.keys()
					.cloned()
					.collect::<Vec<_>>()
					.join(", ");
				Err(ToolError::UnknownWorkspace(format!("workspace is required (configured: {})", known)))
			}
		}
	}
}
