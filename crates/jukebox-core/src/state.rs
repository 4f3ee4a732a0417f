use serde::{Deserialize, Serialize};
use std::fmt;

/// What the player is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    /// The catalog is empty; there is nothing to play.
    NoMedia,
    /// A track is loaded but not playing.
    #[default]
    Paused,
    Playing,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlaybackState::NoMedia => "no-media",
            PlaybackState::Paused => "paused",
            PlaybackState::Playing => "playing",
        };
        f.write_str(s)
    }
}

/// A state change that watchers must hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub old: PlaybackState,
    pub new: PlaybackState,
}

/// Side effects that entering a state asks of the playback backend and the
/// presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    /// Start audio and keep the presentation in the foreground.
    StartForeground,
    /// Pause audio and drop the presentation to the background.
    PauseBackground,
    /// Remove any presentation.
    ClearPresentation,
}

impl PlaybackState {
    pub fn entry_action(self) -> EntryAction {
        match self {
            PlaybackState::Playing => EntryAction::StartForeground,
            PlaybackState::Paused => EntryAction::PauseBackground,
            PlaybackState::NoMedia => EntryAction::ClearPresentation,
        }
    }
}

#[derive(Debug, Default)]
pub struct StateMachine {
    current: PlaybackState,
}

impl StateMachine {
    pub fn current(&self) -> PlaybackState {
        self.current
    }

    pub fn is_playing(&self) -> bool {
        self.current == PlaybackState::Playing
    }

    /// Move to `next`.  Returns the change only when the state actually
    /// differs, so re-entering the current state never notifies.
    pub fn transition(&mut self, next: PlaybackState) -> Option<StateChange> {
        let old = std::mem::replace(&mut self.current, next);
        (old != next).then_some(StateChange { old, new: next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_reports_only_changes() {
        let mut sm = StateMachine::default();
        assert_eq!(sm.current(), PlaybackState::Paused);
        assert_eq!(sm.transition(PlaybackState::Paused), None);
        assert_eq!(
            sm.transition(PlaybackState::Playing),
            Some(StateChange {
                old: PlaybackState::Paused,
                new: PlaybackState::Playing
            })
        );
        assert!(sm.is_playing());
        assert_eq!(sm.transition(PlaybackState::Playing), None);
        assert_eq!(
            sm.transition(PlaybackState::NoMedia).map(|c| c.old),
            Some(PlaybackState::Playing)
        );
    }

    #[test]
    fn test_entry_actions() {
        assert_eq!(
            PlaybackState::Playing.entry_action(),
            EntryAction::StartForeground
        );
        assert_eq!(
            PlaybackState::Paused.entry_action(),
            EntryAction::PauseBackground
        );
        assert_eq!(
            PlaybackState::NoMedia.entry_action(),
            EntryAction::ClearPresentation
        );
    }
}
