//! Visual controls surface, stripped of rendering.
//!
//! Three pieces of control-plane logic back the on-screen controls: the
//! personality carousel (client-local selection, notify-remote on confirm),
//! the cooldown gate in front of the filter pipeline, and the transition
//! video sequencer that bridges the gap between "creating" and "ready".

use crate::error::{AvatarError, Result};
use crate::protocol::{ControlMessage, now_millis};
use std::time::{Duration, Instant};
use tracing::debug;

/// Client-local personality selection.
///
/// Selection is purely local until [`PersonalityCarousel::confirm`], which
/// produces the message to publish to the agent.
#[derive(Debug, Clone)]
pub struct PersonalityCarousel {
    names: Vec<String>,
    selected: usize,
}

impl PersonalityCarousel {
    pub fn new(names: Vec<String>) -> Self {
        Self { names, selected: 0 }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected_name(&self) -> Option<&str> {
        self.names.get(self.selected).map(String::as_str)
    }

    /// Advance the selection, wrapping at the end.
    pub fn next(&mut self) {
        if !self.names.is_empty() {
            self.selected = (self.selected + 1) % self.names.len();
        }
    }

    /// Move the selection back, wrapping at the start.
    pub fn prev(&mut self) {
        if !self.names.is_empty() {
            self.selected = self.selected.checked_sub(1).unwrap_or(self.names.len() - 1);
        }
    }

    /// Jump to a specific entry.
    pub fn select(&mut self, index: usize) -> Result<()> {
        if index >= self.names.len() {
            return Err(AvatarError::Setup(format!(
                "personality index {index} out of range ({} available)",
                self.names.len()
            )));
        }
        self.selected = index;
        Ok(())
    }

    /// Confirm the current selection, producing the notify-remote message.
    pub fn confirm(&self) -> Result<ControlMessage> {
        let name = self
            .selected_name()
            .ok_or_else(|| AvatarError::Setup("no personalities configured".to_owned()))?;
        Ok(ControlMessage::PersonalitySelection {
            name: name.to_owned(),
            index: self.selected as u32,
        })
    }
}

/// Countdown gate in front of the filter pipeline.
///
/// A simple in-memory countdown, deliberately unpersisted: a reload resets
/// it. This is the only mitigation against rapid repeated filter requests —
/// not a mutual-exclusion guarantee.
#[derive(Debug)]
pub struct FilterCooldown {
    duration: Duration,
    last_accepted: Option<Instant>,
}

impl FilterCooldown {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            last_accepted: None,
        }
    }

    /// Try to start a filter run now. Returns whether the gate opened.
    pub fn try_begin(&mut self) -> bool {
        self.try_begin_at(Instant::now())
    }

    /// Clock-injected variant of [`FilterCooldown::try_begin`].
    pub fn try_begin_at(&mut self, now: Instant) -> bool {
        match self.last_accepted {
            Some(last) if now.duration_since(last) < self.duration => {
                debug!(
                    remaining_secs = (self.duration - now.duration_since(last)).as_secs(),
                    "filter request gated by cooldown"
                );
                false
            }
            _ => {
                self.last_accepted = Some(now);
                true
            }
        }
    }

    /// Time left until the gate opens again.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.last_accepted {
            Some(last) => self.duration.saturating_sub(now.duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

/// Phase of the creation transition video sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransitionPhase {
    /// No transition in progress.
    #[default]
    Hidden,
    /// Looping the "generating" video while the asset is created.
    LoopingGenerating,
    /// Playing the one-shot "reveal" video.
    Reveal,
    /// Normal UI restored.
    Normal,
}

/// Sequences the generating-loop → reveal → normal transition.
///
/// The asset-ready signal and the start of the sequence can arrive in either
/// order (messages and state races both happen); the sequencer latches the
/// ready flag so neither ordering gets stuck looping.
#[derive(Debug, Default)]
pub struct TransitionSequencer {
    phase: TransitionPhase,
    asset_ready: bool,
}

impl TransitionSequencer {
    pub fn phase(&self) -> TransitionPhase {
        self.phase
    }

    /// Avatar creation started: begin looping the generating video.
    pub fn begin_generating(&mut self) {
        if self.asset_ready {
            // The ready signal beat us here; skip straight to the reveal.
            self.phase = TransitionPhase::Reveal;
        } else {
            self.phase = TransitionPhase::LoopingGenerating;
        }
    }

    /// The asset-id signal arrived.
    pub fn on_asset_ready(&mut self) {
        self.asset_ready = true;
        if self.phase == TransitionPhase::LoopingGenerating {
            self.phase = TransitionPhase::Reveal;
        }
    }

    /// The one-shot reveal video finished playing.
    pub fn on_reveal_complete(&mut self) {
        if self.phase == TransitionPhase::Reveal {
            self.phase = TransitionPhase::Normal;
            self.asset_ready = false;
        }
    }

    /// Abandon any in-progress sequence.
    pub fn reset(&mut self) {
        self.phase = TransitionPhase::Hidden;
        self.asset_ready = false;
    }
}

/// Build the filter-selection message for an accepted filter run.
#[must_use]
pub fn filter_selected_message(filter_id: &str) -> ControlMessage {
    ControlMessage::FilterSelection {
        filter_id: filter_id.to_owned(),
        timestamp: now_millis(),
    }
}
