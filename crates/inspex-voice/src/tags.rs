//! Inline action tags in streamed assistant text.
//!
//! The assistant embeds commands in what it says, e.g.
//! `"Got it, taking a look [capture_photo: rust on bracket]"`. Text arrives
//! in fragments, so a marker may be split across several chunks. Every scan
//! looks at the whole turn so far and each marker name fires at most once
//! per turn.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[\s*([a-z_]+)\s*(?::\s*([^\]]*))?\]").expect("valid tag regex")
});

/// Unclosed tail that could still grow into a marker
static PARTIAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\[\s*[a-z_]*\s*(?::[^\]]*)?$").expect("valid partial tag regex"));

/// Host-facing command derived from the assistant's text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    SubmitTask,
    CapturePhoto,
    CapturePhotoWithContext(String),
    /// One entry per non-empty line of the marker payload
    ImageFeedback(Vec<String>),
    /// A well-formed marker with a name the engine has no dedicated event for
    Action { name: String, argument: Option<String> },
    /// Cleaned transcript of the turn so far, markers removed
    AssistantText(String),
}

/// Names already emitted in the current turn
#[derive(Debug, Default, Clone)]
pub struct TagDispatchSet {
    fired: HashSet<String>,
}

impl TagDispatchSet {
    /// Record a name; returns false if it already fired this turn.
    pub fn insert(&mut self, name: &str) -> bool {
        self.fired.insert(name.to_string())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fired.contains(name)
    }

    pub fn clear(&mut self) {
        self.fired.clear();
    }

    pub fn len(&self) -> usize {
        self.fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fired.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TagCommandParser {
    buffer: String,
    dispatched: TagDispatchSet,
    last_text: Option<String>,
}

impl TagCommandParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text delta to the turn buffer and scan it.
    pub fn push(&mut self, delta: &str) -> Vec<CommandEvent> {
        self.buffer.push_str(delta);
        let text = std::mem::take(&mut self.buffer);
        let events = self.scan(&text);
        self.buffer = text;
        events
    }

    /// Scan the full accumulated text of the current turn.
    pub fn scan(&mut self, accumulated: &str) -> Vec<CommandEvent> {
        let mut events = Vec::new();

        for caps in TAG_RE.captures_iter(accumulated) {
            let name = caps[1].to_ascii_lowercase();
            if !self.dispatched.insert(&name) {
                continue;
            }
            let argument = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|a| !a.is_empty());
            debug!(tag = %name, "🏷️ Action tag recognised");
            events.push(command_for(name, argument));
        }

        let stripped = TAG_RE.replace_all(accumulated, "");
        let visible = hide_partial_marker(&stripped).trim();
        if !visible.is_empty() && self.last_text.as_deref() != Some(visible) {
            self.last_text = Some(visible.to_string());
            events.push(CommandEvent::AssistantText(visible.to_string()));
        }

        events
    }

    /// Turn boundary: forget the buffer and the names fired in it.
    pub fn reset_turn(&mut self) {
        self.buffer.clear();
        self.dispatched.clear();
        self.last_text = None;
    }

    pub fn dispatched(&self) -> &TagDispatchSet {
        &self.dispatched
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }
}

fn command_for(name: String, argument: Option<String>) -> CommandEvent {
    match (name.as_str(), argument) {
        ("submit_task", _) => CommandEvent::SubmitTask,
        ("capture_photo", None) => CommandEvent::CapturePhoto,
        ("capture_photo", Some(context)) => CommandEvent::CapturePhotoWithContext(context),
        ("image_feedback", arg) => CommandEvent::ImageFeedback(
            arg.map(|a| {
                a.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        ),
        (_, argument) => CommandEvent::Action { name, argument },
    }
}

// An unclosed `[` at the tail may be the start of a marker still streaming in.
fn hide_partial_marker(text: &str) -> &str {
    match text.rfind('[') {
        Some(open) if PARTIAL_RE.is_match(&text[open..]) => &text[..open],
        _ => text,
    }
}
