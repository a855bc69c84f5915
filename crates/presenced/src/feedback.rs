//! Operator feedback: sounds, optional voice, and overlay annotations.

use presence_core::{Classification, FaceRegion, Identity};
use presence_hw::Frame;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use crate::config::Config;

/// One labelled face, in display coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub region: FaceRegion,
    pub label: String,
    pub classification: Classification,
}

/// Fire-and-forget hooks invoked by the workers. Implementations must not block.
pub trait Feedback: Send + Sync {
    fn recognized(&self, identity: &Identity, stream: &str);
    fn unknown(&self, stream: &str);
    /// Overlay hook, called once per processed frame.
    fn annotate(&self, _stream: &str, _frame: &Frame, _annotations: &[Annotation]) {}
}

pub struct NoFeedback;

impl Feedback for NoFeedback {
    fn recognized(&self, _identity: &Identity, _stream: &str) {}
    fn unknown(&self, _stream: &str) {}
}

/// A sound or voice cue played through an external command.
///
/// At most one instance of the cue runs at a time; requests made while it
/// is still playing are dropped.
struct Cue {
    program: String,
    playing: Mutex<Option<Child>>,
}

impl Cue {
    fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            playing: Mutex::new(None),
        }
    }

    fn play(&self, arg: &str) {
        let mut playing = self.playing.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = playing.as_mut() {
            match child.try_wait() {
                Ok(None) => return,
                Ok(Some(_)) | Err(_) => *playing = None,
            }
        }

        match Command::new(&self.program)
            .arg(arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => *playing = Some(child),
            Err(e) => tracing::warn!(
                kind = "feedback_failure",
                program = %self.program,
                error = %e,
                "feedback command failed"
            ),
        }
    }

    #[cfg(test)]
    fn is_playing(&self) -> bool {
        let mut playing = self.playing.lock().unwrap_or_else(|e| e.into_inner());
        matches!(playing.as_mut().map(Child::try_wait), Some(Ok(None)))
    }
}

impl Drop for Cue {
    fn drop(&mut self) {
        if let Some(mut child) = self.playing.get_mut().ok().and_then(Option::take) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Plays a sound per recognition outcome, and optionally speaks a greeting.
pub struct SoundFeedback {
    recognized_sound: PathBuf,
    unknown_sound: PathBuf,
    recognized_cue: Cue,
    unknown_cue: Cue,
    voice: Option<Cue>,
}

impl SoundFeedback {
    pub fn new(
        player: &str,
        recognized_sound: PathBuf,
        unknown_sound: PathBuf,
        voice_command: Option<&str>,
    ) -> Self {
        Self {
            recognized_sound,
            unknown_sound,
            recognized_cue: Cue::new(player),
            unknown_cue: Cue::new(player),
            voice: voice_command.map(Cue::new),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.sound_player,
            config.sound_recognized.clone(),
            config.sound_unknown.clone(),
            config.voice_enabled.then_some(config.voice_command.as_str()),
        )
    }

    fn play_sound(cue: &Cue, path: &PathBuf) {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "feedback sound missing");
            return;
        }
        cue.play(&path.to_string_lossy());
    }
}

impl Feedback for SoundFeedback {
    fn recognized(&self, identity: &Identity, stream: &str) {
        tracing::debug!(stream, identity = %identity.caption(), "recognized feedback");
        Self::play_sound(&self.recognized_cue, &self.recognized_sound);
        if let Some(voice) = &self.voice {
            voice.play(&format!("Bienvenue {}", identity.display_name));
        }
    }

    fn unknown(&self, stream: &str) {
        tracing::debug!(stream, "unknown face feedback");
        Self::play_sound(&self.unknown_cue, &self.unknown_sound);
        if let Some(voice) = &self.voice {
            voice.play("Visage non reconnu");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::Descriptor;
    use std::time::Duration;

    fn alice() -> Identity {
        Identity {
            id: 1,
            display_name: "Alice".into(),
            group_label: "Ops".into(),
            descriptor: Descriptor::new(vec![0.0; 4]),
        }
    }

    #[test]
    fn test_cue_drops_requests_while_playing() {
        let cue = Cue::new("sleep");
        cue.play("1");
        assert!(cue.is_playing());
        let first = cue.playing.lock().unwrap().as_ref().map(Child::id);
        cue.play("1");
        let second = cue.playing.lock().unwrap().as_ref().map(Child::id);
        assert_eq!(first, second);
    }

    #[test]
    fn test_cue_replays_after_finish() {
        let cue = Cue::new("true");
        cue.play("x");
        let first = cue.playing.lock().unwrap().as_ref().map(Child::id);
        std::thread::sleep(Duration::from_millis(200));
        assert!(!cue.is_playing());
        cue.play("x");
        let second = cue.playing.lock().unwrap().as_ref().map(Child::id);
        assert_ne!(first, second);
    }

    #[test]
    fn test_missing_player_is_not_fatal() {
        let cue = Cue::new("/nonexistent/player");
        cue.play("x");
        assert!(!cue.is_playing());
    }

    #[test]
    fn test_sound_feedback_without_sound_files() {
        let feedback = SoundFeedback::new(
            "/nonexistent/player",
            PathBuf::from("/nonexistent/ok.wav"),
            PathBuf::from("/nonexistent/error.wav"),
            None,
        );
        feedback.recognized(&alice(), "door");
        feedback.unknown("door");
        assert!(!feedback.recognized_cue.is_playing());
    }
}
