//! Presence/Typing Coordinator
//!
//! Local side: a per-conversation typing session machine. A session is a run
//! of non-empty input unbroken by an idle period; `typing_start` is emitted
//! once when the session opens and `typing_stop` when the input empties or
//! the idle debounce fires, whichever happens first.
//!
//! Remote side lives in the store (TTL-stamped typing sets); this module
//! also renders the summary string the UI shows.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Presence signal the caller should emit over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

/// Tracks the local user's typing sessions, one per conversation.
pub struct TypingCoordinator {
    idle_timeout: Duration,
    /// conversation id → deadline after which the session goes idle.
    sessions: HashMap<String, Instant>,
}

impl TypingCoordinator {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            sessions: HashMap::new(),
        }
    }

    /// Record an input change. Returns the signal to emit, if any:
    /// `Start` once per session, `Stop` when the input empties. Keystrokes
    /// inside an active session only reset the idle deadline.
    pub fn input_changed(
        &mut self,
        conversation_id: &str,
        has_text: bool,
        now: Instant,
    ) -> Option<TypingSignal> {
        let active = self.sessions.contains_key(conversation_id);
        match (has_text, active) {
            (true, false) => {
                self.sessions
                    .insert(conversation_id.to_string(), now + self.idle_timeout);
                Some(TypingSignal::Start)
            }
            (true, true) => {
                self.sessions
                    .insert(conversation_id.to_string(), now + self.idle_timeout);
                None
            }
            (false, true) => {
                self.sessions.remove(conversation_id);
                Some(TypingSignal::Stop)
            }
            (false, false) => None,
        }
    }

    /// End a session explicitly (message sent, conversation left).
    /// Returns true if a `Stop` should be emitted.
    pub fn end_session(&mut self, conversation_id: &str) -> bool {
        self.sessions.remove(conversation_id).is_some()
    }

    /// Collect conversations whose idle deadline passed; their sessions are
    /// closed and a `Stop` should be emitted for each.
    pub fn idle_stops(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired
    }
}

/// Render the typing participants into a human-readable summary.
///
/// Bands: none → `None`; one → "X is typing..."; two → "X and Y are
/// typing..."; three or more → "A, B and C are typing...".
pub fn typing_summary(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [a] => Some(format!("{a} is typing...")),
        [a, b] => Some(format!("{a} and {b} are typing...")),
        [rest @ .., last] => Some(format!("{} and {} are typing...", rest.join(", "), last)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_millis(3000);

    #[test]
    fn start_emitted_once_per_session() {
        let mut typing = TypingCoordinator::new(IDLE);
        let now = Instant::now();
        assert_eq!(
            typing.input_changed("c1", true, now),
            Some(TypingSignal::Start)
        );
        // Further keystrokes in the same session emit nothing.
        assert_eq!(typing.input_changed("c1", true, now + IDLE / 2), None);
        assert_eq!(typing.input_changed("c1", true, now + IDLE / 2), None);
    }

    #[test]
    fn empty_input_stops_session() {
        let mut typing = TypingCoordinator::new(IDLE);
        let now = Instant::now();
        typing.input_changed("c1", true, now);
        assert_eq!(
            typing.input_changed("c1", false, now),
            Some(TypingSignal::Stop)
        );
        // Stop without an active session is silent.
        assert_eq!(typing.input_changed("c1", false, now), None);
    }

    #[test]
    fn idle_timeout_stops_session_and_keystrokes_reset_it() {
        let mut typing = TypingCoordinator::new(IDLE);
        let now = Instant::now();
        typing.input_changed("c1", true, now);

        // A keystroke just before the deadline pushes it out.
        typing.input_changed("c1", true, now + IDLE - Duration::from_millis(1));
        assert!(typing.idle_stops(now + IDLE).is_empty());

        let stops = typing.idle_stops(now + IDLE * 2);
        assert_eq!(stops, vec!["c1".to_string()]);

        // Session is closed: next input opens a new one.
        assert_eq!(
            typing.input_changed("c1", true, now + IDLE * 2),
            Some(TypingSignal::Start)
        );
    }

    #[test]
    fn sessions_are_per_conversation() {
        let mut typing = TypingCoordinator::new(IDLE);
        let now = Instant::now();
        assert_eq!(
            typing.input_changed("c1", true, now),
            Some(TypingSignal::Start)
        );
        assert_eq!(
            typing.input_changed("c2", true, now),
            Some(TypingSignal::Start)
        );
        assert!(typing.end_session("c1"));
        assert!(!typing.end_session("c1"));
        assert!(typing.end_session("c2"));
    }

    #[test]
    fn summary_grammar_bands() {
        let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(typing_summary(&[]), None);
        assert_eq!(
            typing_summary(&names(&["alice"])).unwrap(),
            "alice is typing..."
        );
        assert_eq!(
            typing_summary(&names(&["alice", "bob"])).unwrap(),
            "alice and bob are typing..."
        );
        assert_eq!(
            typing_summary(&names(&["alice", "bob", "carol"])).unwrap(),
            "alice, bob and carol are typing..."
        );
        assert_eq!(
            typing_summary(&names(&["a", "b", "c", "d"])).unwrap(),
            "a, b, c and d are typing..."
        );
    }
}
