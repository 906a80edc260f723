/// Outcome of the most recent traversal visit to a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionResult {
    /// Not visited (or the recorded frame does not match the queried one).
    #[default]
    None,
    /// Culled by frustum, fog, or an excluder.
    Culled,
    /// Placed on the render list.
    Rendered,
    /// Refined into descendants instead of rendering.
    Refined,
    /// Was rendered, then removed in favor of a renderable ancestor.
    RenderedAndKicked,
    /// Was refined, then the refinement was abandoned for an ancestor.
    RefinedAndKicked,
}

/// Per-tile record of the last traversal outcome, keyed by frame number.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionState {
    frame_number: i32,
    result: SelectionResult,
}

impl SelectionState {
    pub fn new(frame_number: i32, result: SelectionResult) -> Self {
        Self {
            frame_number,
            result,
        }
    }

    /// The recorded result, or `None` when the record is for another frame
    /// (forcing callers to treat the tile as freshly seen).
    pub fn result(&self, frame_number: i32) -> SelectionResult {
        if self.frame_number == frame_number {
            self.result
        } else {
            SelectionResult::None
        }
    }

    /// The pre-kick result for the given frame.
    pub fn original_result(&self, frame_number: i32) -> SelectionResult {
        match self.result(frame_number) {
            SelectionResult::RenderedAndKicked => SelectionResult::Rendered,
            SelectionResult::RefinedAndKicked => SelectionResult::Refined,
            other => other,
        }
    }

    pub fn was_kicked(&self, frame_number: i32) -> bool {
        matches!(
            self.result(frame_number),
            SelectionResult::RenderedAndKicked | SelectionResult::RefinedAndKicked
        )
    }

    /// Demote a rendered/refined result to its kicked variant. Any other
    /// result is left alone.
    pub fn kick(&mut self) {
        self.result = match self.result {
            SelectionResult::Rendered => SelectionResult::RenderedAndKicked,
            SelectionResult::Refined => SelectionResult::RefinedAndKicked,
            other => other,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_frame_reads_none() {
        let state = SelectionState::new(7, SelectionResult::Rendered);
        assert_eq!(state.result(7), SelectionResult::Rendered);
        assert_eq!(state.result(6), SelectionResult::None);
        assert_eq!(state.result(8), SelectionResult::None);
    }

    #[test]
    fn kick_upgrades_rendered_and_refined() {
        let mut state = SelectionState::new(3, SelectionResult::Rendered);
        state.kick();
        assert_eq!(state.result(3), SelectionResult::RenderedAndKicked);
        assert!(state.was_kicked(3));
        assert!(!state.was_kicked(2));

        let mut state = SelectionState::new(3, SelectionResult::Refined);
        state.kick();
        assert_eq!(state.result(3), SelectionResult::RefinedAndKicked);
    }

    #[test]
    fn kick_leaves_other_results_alone() {
        let mut state = SelectionState::new(3, SelectionResult::Culled);
        state.kick();
        assert_eq!(state.result(3), SelectionResult::Culled);
    }

    #[test]
    fn original_result_maps_kicked_back() {
        let mut state = SelectionState::new(5, SelectionResult::Rendered);
        state.kick();
        assert_eq!(state.original_result(5), SelectionResult::Rendered);
        assert_eq!(state.original_result(4), SelectionResult::None);

        let mut state = SelectionState::new(5, SelectionResult::Refined);
        state.kick();
        assert_eq!(state.original_result(5), SelectionResult::Refined);
    }

    #[test]
    fn default_matches_no_frame() {
        let state = SelectionState::default();
        assert_eq!(state.result(1), SelectionResult::None);
        assert_eq!(state.result(0), SelectionResult::None);
    }
}
