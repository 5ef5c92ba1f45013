//! Capability-to-plugin routing table (spec.md §4.6).

use crate::cap_urn::CapUrn;

/// `(cap_urn, plugin_index)` pairs. The same `cap_urn` may appear under
/// multiple indices; lookup takes the first match.
#[derive(Debug, Default, Clone)]
pub struct CapTable {
    entries: Vec<(String, usize)>,
}

impl CapTable {
    /// Build an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `cap` as served by `plugin_index`.
    pub fn insert(&mut self, cap: impl Into<String>, plugin_index: usize) {
        self.entries.push((cap.into(), plugin_index));
    }

    /// Drop every entry pointing at `plugin_index` (used when a plugin
    /// dies and the table is rebuilt).
    pub fn remove_plugin(&mut self, plugin_index: usize) {
        self.entries.retain(|(_, idx)| *idx != plugin_index);
    }

    /// Find a plugin for `requested`, per spec.md §4.6's rule order:
    /// (1) exact URN match; (2) pattern match via `Accepts`, first hit.
    #[must_use]
    pub fn find(&self, requested: &str) -> Option<usize> {
        if let Some((_, idx)) = self.entries.iter().find(|(cap, _)| cap == requested) {
            return Some(*idx);
        }

        let Ok(request_urn) = requested.parse::<CapUrn>() else {
            return None;
        };
        for (registered, idx) in &self.entries {
            if let Ok(registered_urn) = registered.parse::<CapUrn>() {
                if request_urn.accepts(&registered_urn) {
                    return Some(*idx);
                }
            }
        }
        None
    }

    /// Every distinct cap URN currently registered, across all plugins.
    #[must_use]
    pub fn all_caps(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.entries.iter().map(|(cap, _)| cap.clone()).collect();
        caps.sort();
        caps.dedup();
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_wins_over_pattern() {
        let mut table = CapTable::new();
        table.insert("cap:op=x", 0);
        table.insert("cap:op=*", 1);
        assert_eq!(table.find("cap:op=x"), Some(0));
    }

    #[test]
    fn pattern_match_first_hit() {
        let mut table = CapTable::new();
        table.insert("cap:op=*", 0);
        assert_eq!(table.find("cap:op=anything"), Some(0));
    }

    #[test]
    fn no_match_is_none() {
        let table = CapTable::new();
        assert_eq!(table.find("cap:op=x"), None);
    }

    #[test]
    fn remove_plugin_drops_its_entries() {
        let mut table = CapTable::new();
        table.insert("cap:op=x", 0);
        table.insert("cap:op=y", 1);
        table.remove_plugin(0);
        assert_eq!(table.find("cap:op=x"), None);
        assert_eq!(table.find("cap:op=y"), Some(1));
    }
}
