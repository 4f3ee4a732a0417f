//! "Now playing" surface: a one-line status file for bars and widgets to
//! poll, plus a log line whenever it changes.

use jukebox_core::collab::PresentationSink;
use jukebox_core::{PlaybackState, Track};
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct StatusFileSink {
    path: PathBuf,
    last: Option<String>,
    foreground: bool,
}

impl StatusFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: None,
            foreground: false,
        }
    }

    fn write(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{}\n", line))
    }
}

pub fn status_line(track: &Track, state: PlaybackState) -> String {
    let marker = match state {
        PlaybackState::Playing => "▶",
        PlaybackState::Paused => "⏸",
        PlaybackState::NoMedia => "■",
    };
    format!("{} {}", marker, track.display_name())
}

impl PresentationSink for StatusFileSink {
    fn render(&mut self, track: Option<&Track>, state: PlaybackState) {
        let Some(track) = track else {
            self.clear();
            return;
        };
        let line = status_line(track, state);
        if self.last.as_deref() == Some(line.as_str()) {
            return;
        }
        info!("now playing: {}", line);
        if let Err(e) = self.write(&line) {
            warn!("presentation: failed to write {:?}: {}", self.path, e);
        }
        self.last = Some(line);
    }

    fn clear(&mut self) {
        if self.last.take().is_none() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("presentation: cleared"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("presentation: failed to remove {:?}: {}", self.path, e),
        }
    }

    fn set_foreground(&mut self, foreground: bool) {
        if self.foreground != foreground {
            self.foreground = foreground;
            debug!("presentation: foreground={}", foreground);
        }
    }
}
