use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// User preferences that change how interruptions are handled.  Stored in
/// the `[playback]` section of the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    /// Pause when the headset is unplugged.
    #[serde(default = "default_true")]
    pub headset_pause: bool,
    /// Never play through the speaker.
    #[serde(default)]
    pub headset_only: bool,
    /// Keep the now-playing presentation visible while paused.
    #[serde(default = "default_true")]
    pub notify_while_paused: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            headset_pause: true,
            headset_only: false,
            notify_while_paused: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceKey {
    HeadsetPause,
    HeadsetOnly,
    NotifyWhilePaused,
}

impl FromStr for PreferenceKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "headset_pause" => Ok(PreferenceKey::HeadsetPause),
            "headset_only" => Ok(PreferenceKey::HeadsetOnly),
            "notify_while_paused" => Ok(PreferenceKey::NotifyWhilePaused),
            other => Err(format!("unknown preference '{}'", other)),
        }
    }
}

impl Preferences {
    /// Copy one key from `fresh`.  Returns whether the value changed.
    pub fn apply(&mut self, key: PreferenceKey, fresh: &Preferences) -> bool {
        let (slot, value) = match key {
            PreferenceKey::HeadsetPause => (&mut self.headset_pause, fresh.headset_pause),
            PreferenceKey::HeadsetOnly => (&mut self.headset_only, fresh.headset_only),
            PreferenceKey::NotifyWhilePaused => {
                (&mut self.notify_while_paused, fresh.notify_while_paused)
            }
        };
        std::mem::replace(slot, value) != value
    }
}

/// Where `PreferenceChanged` re-reads preferences from.
pub trait PreferenceSource: Send {
    fn load(&mut self) -> anyhow::Result<Preferences>;
}

/// In-memory source, shared with whoever edits it.
impl PreferenceSource for Arc<Mutex<Preferences>> {
    fn load(&mut self) -> anyhow::Result<Preferences> {
        self.lock()
            .map(|p| *p)
            .map_err(|_| anyhow::anyhow!("preference lock poisoned"))
    }
}
