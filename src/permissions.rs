//! Permission tree editor state for admin roles.
//!
//! Modules group sub-permissions; a module checkbox follows the same
//! FULL / PARTIAL / NONE rule as the settlement selections.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::error::{EngineError, EngineResult};
use crate::models::value_str;
use crate::tristate::{GroupState, TriStateGroup};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Permission {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionModule {
    pub key: String,
    pub label: String,
    pub permissions: Vec<Permission>,
}

fn permission_key(p: &Permission) -> String {
    p.key.clone()
}

#[derive(Debug, Clone, Default)]
pub struct PermissionTree {
    modules: Vec<PermissionModule>,
    granted: BTreeSet<String>,
}

impl PermissionTree {
    pub fn new(modules: Vec<PermissionModule>, granted: impl IntoIterator<Item = String>) -> Self {
        let known: BTreeSet<String> = modules
            .iter()
            .flat_map(|m| m.permissions.iter().map(permission_key))
            .collect();
        let granted = granted.into_iter().filter(|k| known.contains(k)).collect();
        Self { modules, granted }
    }

    /// Parse `[{ key, name, permissions: [{ key, name }] }]`.
    pub fn from_value(body: &Value, granted: impl IntoIterator<Item = String>) -> EngineResult<Self> {
        let rows = body
            .as_array()
            .ok_or_else(|| EngineError::Decode("expected a permission module array".into()))?;
        let mut modules = Vec::with_capacity(rows.len());
        for row in rows {
            let key = value_str(row, &["key", "id"])
                .ok_or_else(|| EngineError::Decode("permission module has no key".into()))?;
            let label = value_str(row, &["name", "label"]).unwrap_or_else(|| key.clone());
            let permissions = row
                .get("permissions")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|p| {
                            let key = value_str(p, &["key", "id"])?;
                            let label = value_str(p, &["name", "label"]).unwrap_or_else(|| key.clone());
                            Some(Permission { key, label })
                        })
                        .collect()
                })
                .unwrap_or_default();
            modules.push(PermissionModule {
                key,
                label,
                permissions,
            });
        }
        Ok(Self::new(modules, granted))
    }

    fn module(&self, module_key: &str) -> Option<&PermissionModule> {
        self.modules.iter().find(|m| m.key == module_key)
    }

    pub fn module_state(&self, module_key: &str) -> Option<GroupState> {
        let module = self.module(module_key)?;
        Some(TriStateGroup::new(&module.permissions, permission_key).state(&self.granted))
    }

    pub fn toggle_module(&mut self, module_key: &str) -> Option<GroupState> {
        let module = self.modules.iter().find(|m| m.key == module_key)?;
        Some(TriStateGroup::new(&module.permissions, permission_key).toggle(&mut self.granted))
    }

    /// Flip a single permission. Unknown keys are ignored.
    pub fn toggle_permission(&mut self, key: &str) -> bool {
        let known = self
            .modules
            .iter()
            .any(|m| m.permissions.iter().any(|p| p.key == key));
        if !known {
            return false;
        }
        if !self.granted.remove(key) {
            self.granted.insert(key.to_string());
        }
        true
    }

    pub fn granted(&self) -> Vec<String> {
        self.granted.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(granted: &[&str]) -> PermissionTree {
        let body = serde_json::json!([
            { "key": "settlement", "name": "Settlement", "permissions": [
                { "key": "settlement.view", "name": "View" },
                { "key": "settlement.commit", "name": "Commit" }
            ]},
            { "key": "inventory", "permissions": [
                { "key": "inventory.edit" }
            ]}
        ]);
        PermissionTree::from_value(&body, granted.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn test_module_state_follows_granted_children() {
        let t = tree(&["settlement.view", "ghost.permission"]);
        assert_eq!(t.module_state("settlement"), Some(GroupState::Partial));
        assert_eq!(t.module_state("inventory"), Some(GroupState::None));
        assert_eq!(t.module_state("reports"), None);
        assert_eq!(t.granted(), vec!["settlement.view".to_string()]);
    }

    #[test]
    fn test_module_toggle_clears_partial_then_grants_all() {
        let mut t = tree(&["settlement.view", "inventory.edit"]);
        assert_eq!(t.toggle_module("settlement"), Some(GroupState::None));
        assert_eq!(t.granted(), vec!["inventory.edit".to_string()]);
        assert_eq!(t.toggle_module("settlement"), Some(GroupState::Full));
        assert!(t.toggle_permission("settlement.commit"));
        assert_eq!(t.module_state("settlement"), Some(GroupState::Partial));
        assert!(!t.toggle_permission("unknown"));
    }
}
