use std::collections::HashMap;

use serde::Serialize;

/// Small integer handle for an interned resource type name.
pub type ResourceIndex = u32;

/// Append-only interning table for resource type names.
///
/// Indices are handed out in first-seen order and never change for the life
/// of the table, so compiled catalogs can store indices instead of names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceTypeTable {
    names: Vec<String>,
    #[serde(skip)]
    lookup: HashMap<String, ResourceIndex>,
}

impl ResourceTypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> ResourceIndex {
        if let Some(index) = self.lookup.get(name) {
            return *index;
        }
        let index = self.names.len() as ResourceIndex;
        self.names.push(name.to_string());
        self.lookup.insert(name.to_string(), index);
        index
    }

    pub fn index_of(&self, name: &str) -> Option<ResourceIndex> {
        self.lookup.get(name).copied()
    }

    pub fn name(&self, index: ResourceIndex) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceIndex, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(index, name)| (index as ResourceIndex, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_first_seen_and_stable() {
        let mut table = ResourceTypeTable::new();
        assert_eq!(table.intern("wood"), 0);
        assert_eq!(table.intern("stone"), 1);
        assert_eq!(table.intern("wood"), 0);
        assert_eq!(table.len(), 2);
        assert_eq!(table.name(1), Some("stone"));
        assert_eq!(table.index_of("gold"), None);
        assert_eq!(table.name(9), None);
    }
}
