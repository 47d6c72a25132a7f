//! Global send hooks.
//!
//! Hooks run around every routed message: `pre_send` in registration order
//! before any delivery, `post_send` in registration order after the last
//! receiver. A `pre_send` returning `None` vetoes the send.

use crate::channel::{Channel, ChannelId};
use crate::message::{ChannelMessage, SendContext};
use dashmap::DashMap;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// A named extension point around channel sends.
pub trait SendHook: Send + Sync {
    /// Hook name used in logs.
    fn name(&self) -> &str;

    /// Transform or veto a message before delivery.
    fn pre_send(
        &self,
        message: ChannelMessage,
        _channel: &Channel,
        _ctx: &SendContext,
    ) -> Option<ChannelMessage> {
        Some(message)
    }

    /// Observe a message after delivery.
    fn post_send(&self, _message: &ChannelMessage, _channel: &Channel, _ctx: &SendContext) {}
}

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Ordered list of send hooks.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn SendHook>>,
}

impl HookChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook.
    pub fn push(&mut self, hook: Arc<dyn SendHook>) {
        self.hooks.push(hook);
    }

    /// Number of hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the chain has no hooks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Hook names in invocation order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    /// Run every `pre_send`. Returns `None` if any hook vetoes, panics, or
    /// leaves the message blank.
    pub fn run_pre_send(
        &self,
        mut message: ChannelMessage,
        channel: &Channel,
        ctx: &SendContext,
    ) -> Option<ChannelMessage> {
        for hook in &self.hooks {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| hook.pre_send(message, channel, ctx)));
            message = match result {
                Ok(Some(m)) if !m.is_empty() => m,
                Ok(_) => {
                    debug!(channel = %channel.key(), hook = hook.name(), "Send vetoed by hook");
                    return None;
                }
                Err(payload) => {
                    warn!(
                        channel = %channel.key(),
                        hook = hook.name(),
                        panic = %panic_message(payload.as_ref()),
                        "Pre-send hook panicked, dropping message"
                    );
                    return None;
                }
            };
        }
        if message.is_empty() {
            return None;
        }
        Some(message)
    }

    /// Run every `post_send`. A panicking hook is logged and skipped.
    pub fn run_post_send(&self, message: &ChannelMessage, channel: &Channel, ctx: &SendContext) {
        for hook in &self.hooks {
            let result =
                panic::catch_unwind(AssertUnwindSafe(|| hook.post_send(message, channel, ctx)));
            if let Err(payload) = result {
                warn!(
                    channel = %channel.key(),
                    hook = hook.name(),
                    panic = %panic_message(payload.as_ref()),
                    "Post-send hook panicked"
                );
            }
        }
    }
}

/// Default scrollback length per channel.
pub const DEFAULT_HISTORY_LENGTH: usize = 50;

/// Keeps the last few delivered messages of every channel.
#[derive(Debug)]
pub struct HistoryHook {
    capacity: usize,
    lines: DashMap<ChannelId, VecDeque<ChannelMessage>>,
}

impl HistoryHook {
    /// Create a history hook with the default length.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_LENGTH)
    }

    /// Create a history hook keeping `capacity` messages per channel.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            lines: DashMap::new(),
        }
    }

    /// The most recent `limit` messages of a channel, oldest first.
    #[must_use]
    pub fn recent(&self, channel_key: &str, limit: usize) -> Vec<ChannelMessage> {
        self.lines
            .get(&channel_key.to_lowercase())
            .map(|lines| {
                let skip = lines.len().saturating_sub(limit);
                lines.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Forget a channel's scrollback.
    pub fn clear(&self, channel_key: &str) {
        self.lines.remove(&channel_key.to_lowercase());
    }
}

impl Default for HistoryHook {
    fn default() -> Self {
        Self::new()
    }
}

impl SendHook for HistoryHook {
    fn name(&self) -> &str {
        "history"
    }

    fn post_send(&self, message: &ChannelMessage, channel: &Channel, _ctx: &SendContext) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.entry(channel.key().to_lowercase()).or_default();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(message.clone());
    }
}

/// Vetoes messages longer than a character limit.
#[derive(Debug, Clone, Copy)]
pub struct MaxLengthHook {
    max_chars: usize,
}

impl MaxLengthHook {
    /// Create a hook rejecting bodies longer than `max_chars`.
    #[must_use]
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl SendHook for MaxLengthHook {
    fn name(&self) -> &str {
        "max-length"
    }

    fn pre_send(
        &self,
        message: ChannelMessage,
        channel: &Channel,
        _ctx: &SendContext,
    ) -> Option<ChannelMessage> {
        let len = message.text.chars().count();
        if len > self.max_chars {
            debug!(channel = %channel.key(), len, max = self.max_chars, "Message too long");
            return None;
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Upper;

    impl SendHook for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn pre_send(
            &self,
            message: ChannelMessage,
            _channel: &Channel,
            _ctx: &SendContext,
        ) -> Option<ChannelMessage> {
            let text = message.text.to_uppercase();
            Some(message.with_text(text))
        }
    }

    struct Exclaim;

    impl SendHook for Exclaim {
        fn name(&self) -> &str {
            "exclaim"
        }

        fn pre_send(
            &self,
            message: ChannelMessage,
            _channel: &Channel,
            _ctx: &SendContext,
        ) -> Option<ChannelMessage> {
            let text = format!("{}!", message.text);
            Some(message.with_text(text))
        }
    }

    struct Exploding;

    impl SendHook for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn pre_send(
            &self,
            _message: ChannelMessage,
            _channel: &Channel,
            _ctx: &SendContext,
        ) -> Option<ChannelMessage> {
            panic!("boom");
        }

        fn post_send(&self, _message: &ChannelMessage, _channel: &Channel, _ctx: &SendContext) {
            panic!("boom");
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl SendHook for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn post_send(&self, _message: &ChannelMessage, _channel: &Channel, _ctx: &SendContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_pre_send_runs_in_order() {
        let mut chain = HookChain::new();
        chain.push(Arc::new(Upper));
        chain.push(Arc::new(Exclaim));
        assert_eq!(chain.names(), vec!["upper", "exclaim"]);

        let channel = Channel::new("test");
        let out = chain
            .run_pre_send(ChannelMessage::new("hi"), &channel, &SendContext::new())
            .unwrap();
        assert_eq!(out.text, "HI!");
    }

    #[test]
    fn test_blank_message_is_vetoed() {
        let chain = HookChain::new();
        let channel = Channel::new("test");
        assert!(chain
            .run_pre_send(ChannelMessage::new("  "), &channel, &SendContext::new())
            .is_none());
    }

    #[test]
    fn test_panicking_hooks_are_contained() {
        let counter = Arc::new(Counter::default());
        let mut chain = HookChain::new();
        chain.push(Arc::new(Exploding));
        chain.push(counter.clone());

        let channel = Channel::new("test");
        let ctx = SendContext::new();
        assert!(chain
            .run_pre_send(ChannelMessage::new("hi"), &channel, &ctx)
            .is_none());

        // A panicking post-send hook does not stop later hooks.
        chain.run_post_send(&ChannelMessage::new("hi"), &channel, &ctx);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_max_length_hook() {
        let hook = MaxLengthHook::new(5);
        let channel = Channel::new("test");
        let ctx = SendContext::new();
        assert!(hook
            .pre_send(ChannelMessage::new("short"), &channel, &ctx)
            .is_some());
        assert!(hook
            .pre_send(ChannelMessage::new("too long"), &channel, &ctx)
            .is_none());
    }

    #[test]
    fn test_history_keeps_most_recent() {
        let history = HistoryHook::with_capacity(2);
        let channel = Channel::new("Public");
        let ctx = SendContext::new();
        for text in ["one", "two", "three"] {
            history.post_send(&ChannelMessage::new(text), &channel, &ctx);
        }

        let recent: Vec<String> = history
            .recent("public", 10)
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(recent, vec!["two", "three"]);
        assert_eq!(history.recent("Public", 1)[0].text, "three");

        history.clear("Public");
        assert!(history.recent("Public", 10).is_empty());
    }
}
