/// Reply when the device ran out of memory mid-generation.
pub const RESOURCE_EXHAUSTED_REPLY: &str =
    "Could you say that again? I got a little distracted just now...";

/// Reply for every other generation failure.
pub const GENERIC_FAILURE_REPLY: &str =
    "Oops, my mind just went blank for a second. Could you repeat that?";

/// How a single turn ended. Every variant maps to plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Generated(String),
    Cached(String),
    ResourceExhausted,
    Failed,
}

impl TurnOutcome {
    pub fn text(&self) -> &str {
        match self {
            Self::Generated(text) | Self::Cached(text) => text,
            Self::ResourceExhausted => RESOURCE_EXHAUSTED_REPLY,
            Self::Failed => GENERIC_FAILURE_REPLY,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Generated(text) | Self::Cached(text) => text,
            Self::ResourceExhausted => RESOURCE_EXHAUSTED_REPLY.to_string(),
            Self::Failed => GENERIC_FAILURE_REPLY.to_string(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::ResourceExhausted | Self::Failed)
    }
}
