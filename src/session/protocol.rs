use serde::{Deserialize, Serialize};

use crate::source::SourceRef;

/// Events a client sends to its session
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    Run {
        source: SourceRef,
        #[serde(default)]
        input: Option<String>,
    },
    Input {
        text: String,
    },
    Stop,
    Disconnect,
}

/// Events a session sends to its client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Output { text: String },
    Compiled,
    Done,
}

impl ServerEvent {
    pub fn output(text: impl Into<String>) -> Self {
        Self::Output { text: text.into() }
    }
}

/// Input is delivered as whole lines; a missing terminator is added
pub fn frame_line(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}\n")
    }
}
