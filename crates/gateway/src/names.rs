//! Friendly names for provider-qualified tool ids.

use std::collections::HashMap;

use crate::descriptor::{ID_SEPARATOR, ToolDescriptor};

/// Bidirectional `id <-> friendly name` tables built from one catalog snapshot.
///
/// Names are only stable for the snapshot they were built from; a rebuild
/// after the catalog changes may hand a name to a different tool.
#[derive(Debug, Clone, Default)]
pub struct NameMapping {
    by_id: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl NameMapping {
    /// Build the mapping. Input order does not matter: entries are assigned
    /// in id order, and later collisions get `_2`, `_3`, ... appended.
    pub fn build(tools: &[ToolDescriptor]) -> Self {
        let mut sorted: Vec<&ToolDescriptor> = tools.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let mut mapping = Self::default();
        for tool in sorted {
            if mapping.by_id.contains_key(&tool.id) {
                continue;
            }
            let base = friendly_base(&tool.provider_name, &tool.local_name);
            let mut name = base.clone();
            let mut suffix = 2;
            while mapping.by_name.contains_key(&name) {
                name = format!("{base}_{suffix}");
                suffix += 1;
            }
            mapping.by_name.insert(name.clone(), tool.id.clone());
            mapping.by_id.insert(tool.id.clone(), name);
        }
        mapping
    }

    pub fn friendly_name(&self, id: &str) -> Option<&str> {
        self.by_id.get(id).map(String::as_str)
    }

    /// Resolve a friendly name or raw id to an id.
    ///
    /// Anything containing the id separator is taken as an id without a
    /// lookup. `None` means "not known to this snapshot".
    pub fn resolve<'a>(&'a self, name_or_id: &'a str) -> Option<&'a str> {
        if name_or_id.contains(ID_SEPARATOR) {
            return Some(name_or_id);
        }
        self.by_name.get(name_or_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn friendly_base(provider_name: &str, local_name: &str) -> String {
    let provider = camel_case(provider_name);
    let tool = camel_case(local_name);
    let mut name = if provider.is_empty() {
        tool
    } else {
        provider + &capitalize(&tool)
    };
    if name.is_empty() {
        name.push_str("tool");
    } else if name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// `"search_repos"` -> `"searchRepos"`, `"GitHub"` -> `"gitHub"`.
fn camel_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, word) in s
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .enumerate()
    {
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            if i == 0 {
                out.push(first.to_ascii_lowercase());
            } else {
                out.push(first.to_ascii_uppercase());
            }
            out.extend(chars);
        }
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
