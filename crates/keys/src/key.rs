//! An opaque upstream credential string. Identity is by
//! exact string equality; the only thing we ever do with the contents is
//! hand them to the upstream client or redact them for logs.

use std::fmt;

/// Number of leading characters shown when a key is redacted for logging.
const REDACT_PREFIX_LEN: usize = 8;

/// An upstream API credential. Cloning is cheap (an `Arc<str>` underneath)
/// since the same key value is copied into rotation cursors, cooldown maps,
/// and pool entries throughout the subsystem.
#[derive(Clone, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Key(std::sync::Arc<str>);

impl Key {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(std::sync::Arc::from(raw.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `REDACT_PREFIX_LEN` characters followed by an ellipsis. Never
    /// print a `Key` with `{}`/`Display`-style formatting outside this.
    pub fn redacted(&self) -> String {
        let take = self.0.chars().count().min(REDACT_PREFIX_LEN);
        let prefix: String = self.0.chars().take(take).collect();
        format!("{prefix}…")
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::new(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::new(s)
    }
}

// Deliberately not `Display`: redact() is the only sanctioned way to print
// a key. `Debug` redacts too, so `{:?}` in a stray log line stays safe.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.redacted())
    }
}
