//! In-memory TTL cache mapping tool_call_id -> upstream thought signatures.
//!
//! The upstream wire format requires that an assistant turn containing a
//! `functionCall` part be preceded by a `thought` part carrying a matching
//! `thoughtSignature` whenever thinking was enabled for that turn. The
//! OpenAI and Claude dialects a client actually speaks do not carry that
//! signature in their own history representation (Claude's tool_use block
//! has no signature field, OpenAI's tool_calls even less so), so this cache
//! is how the proxy remembers it from the streamed/unary response and
//! replays it on the following turn.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sentinel inserted for Gemini-dialect tool replays when no real signature was
/// ever cached (thinking off, or history originated from a non-Gemini dialect).
/// Upstream accepts any non-empty signature as long as a thought part precedes
/// the functionCall; this unblocks validation without claiming a real thought.
pub const SENTINEL_THOUGHT_SIGNATURE: &str = "qproxy-sentinel-thought-signature";

const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SignatureCacheConfig {
    pub ttl: Duration,
}

impl Default for SignatureCacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

/// The `claude_tool_thinking` entry: the extended-thinking block that preceded
/// a `tool_use` block in a Claude-dialect response, kept so the *next* turn's
/// replayed assistant message can carry it back for upstream validation.
#[derive(Debug, Clone)]
pub struct ClaudeToolThinking {
    pub signature: String,
    pub thought_text: String,
}

struct Entry<V> {
    value: V,
    saved_at: Instant,
}

struct TtlMap<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlMap<V> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.entries.lock().expect("signature cache mutex poisoned");
        match guard.get(key) {
            Some(entry) if entry.saved_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, value: V) {
        let mut guard = self.entries.lock().expect("signature cache mutex poisoned");
        guard.insert(
            key,
            Entry {
                value,
                saved_at: Instant::now(),
            },
        );
    }

    fn sweep(&self) {
        let mut guard = self.entries.lock().expect("signature cache mutex poisoned");
        let ttl = self.ttl;
        guard.retain(|_, entry| entry.saved_at.elapsed() < ttl);
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("signature cache mutex poisoned").len()
    }
}

/// Two independent TTL'd maps per §4.4: Gemini functionCall thought-signature
/// replay, and Claude's extended-thinking-block-before-tool_use replay.
pub struct SignatureCache {
    tool_thought_signature: TtlMap<String>,
    claude_tool_thinking: TtlMap<ClaudeToolThinking>,
}

impl SignatureCache {
    pub fn new(config: SignatureCacheConfig) -> Self {
        Self {
            tool_thought_signature: TtlMap::new(config.ttl),
            claude_tool_thinking: TtlMap::new(config.ttl),
        }
    }

    pub fn get_thought_signature(&self, tool_call_id: &str) -> Option<String> {
        self.tool_thought_signature.get(tool_call_id)
    }

    pub fn put_thought_signature(&self, tool_call_id: impl Into<String>, signature: impl Into<String>) {
        self.tool_thought_signature.put(tool_call_id.into(), signature.into());
    }

    pub fn get_tool_thinking(&self, tool_call_id: &str) -> Option<ClaudeToolThinking> {
        self.claude_tool_thinking.get(tool_call_id)
    }

    pub fn put_tool_thinking(&self, tool_call_id: impl Into<String>, thinking: ClaudeToolThinking) {
        self.claude_tool_thinking.put(tool_call_id.into(), thinking);
    }

    /// Lazy eviction sweep; callers may run this periodically (e.g. from a
    /// background interval) but every read/write already self-evicts its own key.
    pub fn sweep_expired(&self) {
        self.tool_thought_signature.sweep();
        self.claude_tool_thinking.sweep();
    }

    pub fn len(&self) -> (usize, usize) {
        (self.tool_thought_signature.len(), self.claude_tool_thinking.len())
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(SignatureCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn round_trips_within_ttl() {
        let cache = SignatureCache::new(SignatureCacheConfig {
            ttl: Duration::from_secs(60),
        });
        cache.put_thought_signature("toolu_1", "sig-abc");
        assert_eq!(cache.get_thought_signature("toolu_1").as_deref(), Some("sig-abc"));
    }

    #[test]
    fn expires_after_ttl() {
        let cache = SignatureCache::new(SignatureCacheConfig {
            ttl: Duration::from_millis(10),
        });
        cache.put_thought_signature("toolu_1", "sig-abc");
        sleep(Duration::from_millis(25));
        assert_eq!(cache.get_thought_signature("toolu_1"), None);
    }

    #[test]
    fn tool_thinking_round_trips() {
        let cache = SignatureCache::default();
        cache.put_tool_thinking(
            "toolu_2",
            ClaudeToolThinking {
                signature: "sig-xyz".to_string(),
                thought_text: "reasoning...".to_string(),
            },
        );
        let cached = cache.get_tool_thinking("toolu_2").expect("entry present");
        assert_eq!(cached.signature, "sig-xyz");
    }

    #[test]
    fn miss_returns_none() {
        let cache = SignatureCache::default();
        assert!(cache.get_thought_signature("missing").is_none());
        assert!(cache.get_tool_thinking("missing").is_none());
    }
}
