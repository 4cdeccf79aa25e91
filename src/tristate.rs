//! Parent/children checkbox selection.
//!
//! A parent is FULL when every child is selected, NONE when no child is, and
//! PARTIAL otherwise. Toggling a FULL or PARTIAL parent clears its children;
//! toggling a NONE parent selects all of them. The same rule drives the
//! per-merchant candidate header, the franchise merchant picker and the
//! permission tree editor.

use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Full,
    Partial,
    None,
}

/// A borrowed view of a parent's children, keyed through `id_of`.
pub struct TriStateGroup<'a, C, F> {
    children: &'a [C],
    id_of: F,
}

impl<'a, C, Id, F> TriStateGroup<'a, C, F>
where
    F: Fn(&C) -> Id,
    Id: Ord + Clone,
{
    pub fn new(children: &'a [C], id_of: F) -> Self {
        Self { children, id_of }
    }

    pub fn child_ids(&self) -> BTreeSet<Id> {
        self.children.iter().map(&self.id_of).collect()
    }

    pub fn state(&self, selected: &BTreeSet<Id>) -> GroupState {
        let total = self.children.len();
        let hits = self
            .children
            .iter()
            .filter(|c| selected.contains(&(self.id_of)(*c)))
            .count();
        match hits {
            0 => GroupState::None,
            n if n == total => GroupState::Full,
            _ => GroupState::Partial,
        }
    }

    /// Apply a parent click to `selected` and return the resulting state.
    /// Ids that are not children of this parent are left alone.
    pub fn toggle(&self, selected: &mut BTreeSet<Id>) -> GroupState {
        match self.state(selected) {
            GroupState::Full | GroupState::Partial => {
                for child in self.children {
                    selected.remove(&(self.id_of)(child));
                }
            }
            GroupState::None => {
                selected.extend(self.children.iter().map(&self.id_of));
            }
        }
        self.state(selected)
    }
}
