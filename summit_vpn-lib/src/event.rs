use serde::Serialize;

use std::fmt::{self, Display};

/// Connection state as reported to the surrounding service and the UI.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Connecting,
    Reconnecting,
    Connected,
    Disconnected,
    Paused,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct StateEvent {
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StateEvent {
    pub fn new(state: State) -> Self {
        StateEvent { state, message: None }
    }

    pub fn with_message(state: State, message: impl Into<String>) -> Self {
        StateEvent {
            state,
            message: Some(message.into()),
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Connecting => write!(f, "CONNECTING"),
            State::Reconnecting => write!(f, "RECONNECTING"),
            State::Connected => write!(f, "CONNECTED"),
            State::Disconnected => write!(f, "DISCONNECTED"),
            State::Paused => write!(f, "PAUSED"),
        }
    }
}

impl Display for StateEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} ({message})", self.state),
            None => write!(f, "{}", self.state),
        }
    }
}
