//! TUI application state and key handling.
//!
//! The app never mutates call state itself: keys become [`Intent`]s sent
//! to the controller, and the next snapshot tells the screen what
//! actually happened.

use crossterm::event::{KeyCode, KeyEvent};

use crate::call::controller::{Intent, PhoneHandle, PhoneSnapshot};
use crate::call::CallState;

/// Longest dialable number; FreePBX feature codes stay well under this.
const MAX_DIAL_DIGITS: usize = 24;

pub struct App {
    pub should_exit: bool,
    /// Latest controller snapshot; replaced wholesale on every change.
    pub snapshot: PhoneSnapshot,
    /// Digits typed while idle, waiting for Enter.
    pub dial: String,
    /// Log pane visibility.
    pub show_log: bool,
}

impl App {
    pub fn new(snapshot: PhoneSnapshot) -> Self {
        Self {
            should_exit: false,
            snapshot,
            dial: String::new(),
            show_log: false,
        }
    }

    pub fn call_state(&self) -> Option<CallState> {
        self.snapshot.call.as_ref().map(|c| c.state)
    }

    pub fn is_ringing(&self) -> bool {
        self.call_state() == Some(CallState::Ringing)
    }

    fn in_call(&self) -> bool {
        matches!(
            self.call_state(),
            Some(CallState::Active | CallState::Held | CallState::Establishing)
        )
    }

    /// Translate one key press into intents or local UI changes.
    pub fn handle_key(&mut self, key: KeyEvent, phone: &PhoneHandle) {
        // Ringing takes over the keyboard: answer or reject first.
        if self.is_ringing() {
            match key.code {
                KeyCode::Char('a') | KeyCode::Enter => phone.send(Intent::Accept),
                KeyCode::Char('r') => phone.send(Intent::Reject),
                KeyCode::Char('q') => self.quit(phone),
                _ => {}
            }
            return;
        }

        match key.code {
            KeyCode::Char('q') => self.quit(phone),
            KeyCode::Esc => {
                if !self.dial.is_empty() {
                    self.dial.clear();
                } else {
                    self.quit(phone);
                }
            }
            KeyCode::Char('c') => phone.send(Intent::Connect),
            KeyCode::Char('d') => phone.send(Intent::Disconnect),
            KeyCode::Char('l') => self.show_log = !self.show_log,
            KeyCode::Char('h') if self.in_call() => phone.send(Intent::Hangup),
            KeyCode::Char('m') if self.in_call() => phone.send(Intent::ToggleMute),
            KeyCode::Char('o') if self.in_call() => phone.send(Intent::ToggleHold),
            KeyCode::Char(c) if is_dial_char(c) && !self.in_call() => {
                if self.dial.len() < MAX_DIAL_DIGITS {
                    self.dial.push(c);
                }
            }
            KeyCode::Backspace => {
                self.dial.pop();
            }
            KeyCode::Enter => {
                if !self.dial.is_empty() {
                    let number = std::mem::take(&mut self.dial);
                    phone.send(Intent::Dial { number });
                }
            }
            _ => {}
        }
    }

    fn quit(&mut self, phone: &PhoneHandle) {
        phone.send(Intent::Disconnect);
        self.should_exit = true;
    }
}

/// Digits plus the two DTMF symbols valid in a dial string.
fn is_dial_char(c: char) -> bool {
    c.is_ascii_digit() || c == '*' || c == '#'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEventKind, KeyEventState, KeyModifiers};
    use tokio::sync::{mpsc, watch};

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent {
            code,
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    fn harness() -> (App, PhoneHandle, mpsc::UnboundedReceiver<Intent>) {
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        let (_snap_tx, snap_rx) = watch::channel(PhoneSnapshot::default());
        let phone = PhoneHandle::detached(intent_tx, snap_rx);
        (App::new(PhoneSnapshot::default()), phone, intent_rx)
    }

    #[test]
    fn test_digits_build_the_dial_buffer() {
        let (mut app, phone, mut intents) = harness();
        for c in ['9', '1', '1'] {
            app.handle_key(key(KeyCode::Char(c)), &phone);
        }
        assert_eq!(app.dial, "911");

        app.handle_key(key(KeyCode::Backspace), &phone);
        assert_eq!(app.dial, "91");

        app.handle_key(key(KeyCode::Enter), &phone);
        assert_eq!(app.dial, "");
        match intents.try_recv().unwrap() {
            Intent::Dial { number } => assert_eq!(number, "91"),
            other => panic!("unexpected intent: {other:?}"),
        }
    }

    #[test]
    fn test_enter_with_empty_buffer_sends_nothing() {
        let (mut app, phone, mut intents) = harness();
        app.handle_key(key(KeyCode::Enter), &phone);
        assert!(intents.try_recv().is_err());
    }

    #[test]
    fn test_escape_clears_buffer_before_quitting() {
        let (mut app, phone, _intents) = harness();
        app.handle_key(key(KeyCode::Char('5')), &phone);
        app.handle_key(key(KeyCode::Esc), &phone);
        assert_eq!(app.dial, "");
        assert!(!app.should_exit);

        app.handle_key(key(KeyCode::Esc), &phone);
        assert!(app.should_exit);
    }

    #[test]
    fn test_ringing_captures_answer_and_reject_keys() {
        let (mut app, phone, mut intents) = harness();
        app.snapshot.call = Some(crate::call::Call::inbound(
            crate::call::CallId::new(),
            "2001",
            None,
        ));

        // Digits are not dialable while ringing.
        app.handle_key(key(KeyCode::Char('5')), &phone);
        assert_eq!(app.dial, "");

        app.handle_key(key(KeyCode::Char('a')), &phone);
        assert!(matches!(intents.try_recv().unwrap(), Intent::Accept));

        app.handle_key(key(KeyCode::Char('r')), &phone);
        assert!(matches!(intents.try_recv().unwrap(), Intent::Reject));
    }

    #[test]
    fn test_in_call_keys_require_a_call() {
        let (mut app, phone, mut intents) = harness();
        // No call: h/m/o do nothing.
        app.handle_key(key(KeyCode::Char('m')), &phone);
        assert!(intents.try_recv().is_err());

        let mut call = crate::call::Call::outbound("911");
        call.state = CallState::Active;
        app.snapshot.call = Some(call);

        app.handle_key(key(KeyCode::Char('m')), &phone);
        assert!(matches!(intents.try_recv().unwrap(), Intent::ToggleMute));
        app.handle_key(key(KeyCode::Char('o')), &phone);
        assert!(matches!(intents.try_recv().unwrap(), Intent::ToggleHold));
        app.handle_key(key(KeyCode::Char('h')), &phone);
        assert!(matches!(intents.try_recv().unwrap(), Intent::Hangup));
    }

    #[test]
    fn test_quit_disconnects_first() {
        let (mut app, phone, mut intents) = harness();
        app.handle_key(key(KeyCode::Char('q')), &phone);
        assert!(app.should_exit);
        assert!(matches!(intents.try_recv().unwrap(), Intent::Disconnect));
    }
}
