//! Unsaved-changes guard.
//!
//! "Would lose work" means a batch is active and at least one entity has a
//! non-empty selection. It is read from the live workspace on every call;
//! both the page-unload hook and the in-app confirmation gate go through
//! [`UnsavedChangesGuard::has_unsaved_changes`].

use crate::engine::SettlementEngine;

pub const UNSAVED_CHANGES_PROMPT: &str =
    "You have selected transactions that are not settled yet. Discard the selection and leave?";

/// Synchronous yes/no prompt supplied by the caller (dialog, CLI prompt,
/// test stub).
pub trait ConfirmationGate {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F> ConfirmationGate for F
where
    F: Fn(&str) -> bool,
{
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

pub struct UnsavedChangesGuard<'a, A> {
    engine: &'a SettlementEngine<A>,
}

impl<A> UnsavedChangesGuard<'_, A> {
    pub fn has_unsaved_changes(&self) -> bool {
        self.engine.workspace().has_unsaved_changes()
    }

    /// Full-page unload hook: the prompt to show, or `None` to let the page
    /// go without asking.
    pub fn before_unload(&self) -> Option<&'static str> {
        self.has_unsaved_changes().then_some(UNSAVED_CHANGES_PROMPT)
    }

    /// In-app navigation gate. Returns whether the caller may proceed.
    pub fn confirm_discard(&self, gate: &dyn ConfirmationGate) -> bool {
        !self.has_unsaved_changes() || gate.confirm(UNSAVED_CHANGES_PROMPT)
    }
}

impl<A> SettlementEngine<A> {
    pub fn guard(&self) -> UnsavedChangesGuard<'_, A> {
        UnsavedChangesGuard { engine: self }
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.guard().has_unsaved_changes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, direct_engine};
    use std::cell::Cell;

    #[tokio::test]
    async fn test_guard_tracks_live_selection_state() {
        let (engine, mock, batch) = direct_engine("m-1").await;
        mock.set_candidates("m-1", vec![candidate("t1", "3.00", "0.03")]);
        engine.fetch_candidates(&batch, "m-1").await.unwrap();

        assert!(!engine.has_unsaved_changes());
        assert_eq!(engine.guard().before_unload(), None);

        engine.toggle("m-1", "t1").unwrap();
        assert!(engine.has_unsaved_changes());
        assert_eq!(engine.guard().before_unload(), Some(UNSAVED_CHANGES_PROMPT));

        engine.toggle("m-1", "t1").unwrap();
        assert!(!engine.has_unsaved_changes());
    }

    #[tokio::test]
    async fn test_confirm_discard_only_prompts_when_work_would_be_lost() {
        let (engine, mock, batch) = direct_engine("m-1").await;
        mock.set_candidates("m-1", vec![candidate("t1", "3.00", "0.03")]);
        engine.fetch_candidates(&batch, "m-1").await.unwrap();

        let prompts = Cell::new(0);
        let decline = |prompt: &str| {
            assert_eq!(prompt, UNSAVED_CHANGES_PROMPT);
            prompts.set(prompts.get() + 1);
            false
        };

        assert!(engine.guard().confirm_discard(&decline));
        assert_eq!(prompts.get(), 0);

        engine.select_all("m-1").unwrap();
        assert!(!engine.guard().confirm_discard(&decline));
        assert_eq!(prompts.get(), 1);
        assert!(engine.guard().confirm_discard(&|_: &str| true));
    }

    #[tokio::test]
    async fn test_no_batch_means_nothing_to_lose() {
        let (engine, _mock, batch) = direct_engine("m-1").await;
        engine.apply_filter(&crate::models::BatchFilter {
            product_id: batch.product_id + 1,
            ..batch.filter()
        });
        assert!(!engine.has_unsaved_changes());
        assert!(engine.guard().confirm_discard(&|_: &str| false));
    }
}
