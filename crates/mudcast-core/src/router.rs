//! Broadcast router for mudcast.
//!
//! The router turns one channel message into deliveries: it picks the
//! receivers (deduplicated, mute- and capability-filtered), runs the global
//! pre-send hooks, drives the per-receiver hook sequence, and finishes with the
//! post-send hooks. A failing receiver never stops delivery to the others.

use crate::channel::{AccessPolicy, Capability, Channel, LockPolicy};
use crate::entity::{DeliveryError, Receiver, ReceiverRef};
use crate::hooks::{panic_message, HookChain, SendHook};
use crate::message::{ChannelMessage, SendContext};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{trace, warn};

/// Outcome of one routed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Receivers left after deduplication and filtering.
    pub candidates: usize,
    /// Receivers that got the message, including those whose post-delivery
    /// hook then failed.
    pub delivered: usize,
    /// Receivers whose own pre-delivery hook dropped the message.
    pub skipped: usize,
    /// Receivers that did not get the message because a hook failed.
    pub failed: usize,
    /// Delivered receivers whose post-delivery hook failed.
    pub post_failed: usize,
    /// A pre-send hook vetoed the whole send.
    pub vetoed: bool,
}

/// Result of delivering to a single receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// Delivered, then the post-delivery hook failed.
    PostFailed,
    Skipped,
    Failed,
}

/// The channel message router.
#[derive(Clone)]
pub struct BroadcastRouter {
    /// Global send hooks.
    hooks: HookChain,
    /// Capability check.
    policy: Arc<dyn AccessPolicy>,
}

impl BroadcastRouter {
    /// Create a router that checks the channels' own locks.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(Arc::new(LockPolicy))
    }

    /// Create a router with a custom capability check.
    #[must_use]
    pub fn with_policy(policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            hooks: HookChain::new(),
            policy,
        }
    }

    /// Append a global send hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn SendHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Get the hook chain.
    #[must_use]
    pub fn hooks(&self) -> &HookChain {
        &self.hooks
    }

    /// Get the capability check.
    #[must_use]
    pub fn policy(&self) -> &Arc<dyn AccessPolicy> {
        &self.policy
    }

    /// Deduplicate and filter candidates.
    ///
    /// A candidate is kept if it is the first with its identity, it has not
    /// muted the channel (unless `bypass_mute`), and it holds `listen`.
    /// Enumeration order is preserved.
    #[must_use]
    pub fn select_receivers<I>(
        &self,
        candidates: I,
        channel: &Channel,
        bypass_mute: bool,
    ) -> Vec<ReceiverRef>
    where
        I: IntoIterator<Item = ReceiverRef>,
    {
        let mut seen = HashSet::new();
        candidates
            .into_iter()
            .filter(|r| seen.insert(r.id().clone()))
            .filter(|r| bypass_mute || !channel.is_muted(r.id()))
            .filter(|r| {
                self.policy
                    .has_capability(&**r, channel, Capability::Listen)
            })
            .collect()
    }

    /// Route a message to a channel's subscribers.
    pub fn route(
        &self,
        message: ChannelMessage,
        channel: &Channel,
        ctx: &SendContext,
    ) -> RouteReport {
        self.deliver_to(channel.candidates(), message, channel, ctx)
    }

    /// Route a message to an explicit candidate enumeration, which may repeat
    /// identities.
    pub fn deliver_to<I>(
        &self,
        candidates: I,
        mut message: ChannelMessage,
        channel: &Channel,
        ctx: &SendContext,
    ) -> RouteReport
    where
        I: IntoIterator<Item = ReceiverRef>,
    {
        if message.senders.is_empty() {
            message.senders = ctx.senders.clone();
        }

        let receivers = self.select_receivers(candidates, channel, ctx.bypass_mute);
        let mut report = RouteReport {
            candidates: receivers.len(),
            ..RouteReport::default()
        };

        let Some(message) = self.hooks.run_pre_send(message, channel, ctx) else {
            report.vetoed = true;
            return report;
        };

        for receiver in &receivers {
            match deliver_one(&**receiver, &message, channel, ctx) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::PostFailed => {
                    report.delivered += 1;
                    report.post_failed += 1;
                }
                Delivery::Skipped => report.skipped += 1,
                Delivery::Failed => report.failed += 1,
            }
        }

        self.hooks.run_post_send(&message, channel, ctx);

        trace!(
            channel = %channel.key(),
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            post_failed = report.post_failed,
            "Routed message"
        );
        report
    }
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the per-receiver hook sequence, containing errors and panics.
fn deliver_one(
    receiver: &dyn Receiver,
    message: &ChannelMessage,
    channel: &Channel,
    ctx: &SendContext,
) -> Delivery {
    let delivered = panic::catch_unwind(AssertUnwindSafe(
        || -> Result<Option<ChannelMessage>, DeliveryError> {
            let Some(personal) = receiver.at_pre_channel_msg(message.clone(), channel, ctx)? else {
                return Ok(None);
            };
            if personal.is_empty() {
                return Ok(None);
            }
            receiver.channel_msg(&personal, channel, ctx)?;
            Ok(Some(personal))
        },
    ));

    let personal = match delivered {
        Ok(Ok(Some(personal))) => personal,
        Ok(Ok(None)) => return Delivery::Skipped,
        Ok(Err(e)) => {
            warn!(
                channel = %channel.key(),
                receiver = %receiver.id(),
                error = %e,
                "Channel delivery failed"
            );
            return Delivery::Failed;
        }
        Err(payload) => {
            warn!(
                channel = %channel.key(),
                receiver = %receiver.id(),
                panic = %panic_message(payload.as_ref()),
                "Channel delivery panicked"
            );
            return Delivery::Failed;
        }
    };

    let post = panic::catch_unwind(AssertUnwindSafe(|| {
        receiver.at_post_channel_msg(&personal, channel, ctx)
    }));
    match post {
        Ok(Ok(())) => Delivery::Delivered,
        Ok(Err(e)) => {
            warn!(
                channel = %channel.key(),
                receiver = %receiver.id(),
                error = %e,
                "Post-delivery hook failed"
            );
            Delivery::PostFailed
        }
        Err(payload) => {
            warn!(
                channel = %channel.key(),
                receiver = %receiver.id(),
                panic = %panic_message(payload.as_ref()),
                "Post-delivery hook panicked"
            );
            Delivery::PostFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AccessRule, ChannelLocks};
    use crate::entity::EntityId;
    use crate::testing::TestReceiver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Veto;

    impl SendHook for Veto {
        fn name(&self) -> &str {
            "veto"
        }

        fn pre_send(
            &self,
            _message: ChannelMessage,
            _channel: &Channel,
            _ctx: &SendContext,
        ) -> Option<ChannelMessage> {
            None
        }
    }

    #[derive(Default)]
    struct PostCounter(AtomicUsize);

    impl SendHook for PostCounter {
        fn name(&self) -> &str {
            "post-counter"
        }

        fn post_send(&self, _message: &ChannelMessage, _channel: &Channel, _ctx: &SendContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handles(receivers: &[&Arc<TestReceiver>]) -> Vec<ReceiverRef> {
        receivers
            .iter()
            .map(|r| Arc::clone(*r) as ReceiverRef)
            .collect()
    }

    #[test]
    fn test_duplicates_receive_once() {
        let a = Arc::new(TestReceiver::new("A"));
        let b = Arc::new(TestReceiver::new("B"));
        let channel = Channel::new("C");

        let report = BroadcastRouter::new().deliver_to(
            handles(&[&a, &b, &a]),
            ChannelMessage::new("hello"),
            &channel,
            &SendContext::new(),
        );

        assert_eq!(report.delivered, 2);
        assert_eq!(a.inbox().len(), 1);
        assert_eq!(b.inbox().len(), 1);
    }

    #[test]
    fn test_muted_duplicate_scenario() {
        // Subscribers [A, B, A], A muted: only B hears it, once.
        let a = Arc::new(TestReceiver::new("A"));
        let b = Arc::new(TestReceiver::new("B"));
        let a_ref: ReceiverRef = a.clone();
        let b_ref: ReceiverRef = b.clone();
        let mut channel = Channel::new("C");
        channel.subscribe(&a_ref);
        channel.subscribe(&b_ref);
        channel.mute(&EntityId::new("A"));

        let report = BroadcastRouter::new().deliver_to(
            handles(&[&a, &b, &a]),
            ChannelMessage::new("hello"),
            &channel,
            &SendContext::new(),
        );

        assert_eq!(report.candidates, 1);
        assert!(a.inbox().is_empty());
        assert_eq!(b.inbox(), vec!["[C] hello".to_string()]);
    }

    #[test]
    fn test_bypass_mute_includes_muted() {
        let a = Arc::new(TestReceiver::new("A"));
        let a_ref: ReceiverRef = a.clone();
        let mut channel = Channel::new("C");
        channel.subscribe(&a_ref);
        channel.mute(&EntityId::new("A"));

        let router = BroadcastRouter::new();
        router.route(ChannelMessage::new("quiet"), &channel, &SendContext::new());
        assert!(a.inbox().is_empty());

        router.route(
            ChannelMessage::new("loud"),
            &channel,
            &SendContext::new().bypass_mute(true),
        );
        assert_eq!(a.inbox(), vec!["[C] loud".to_string()]);
    }

    #[test]
    fn test_listen_capability_required_even_with_bypass() {
        let a = Arc::new(TestReceiver::new("A"));
        let b = Arc::new(TestReceiver::new("B"));
        let deny: std::collections::BTreeSet<EntityId> =
            [EntityId::new("A")].into_iter().collect();
        let channel = Channel::new("C")
            .with_locks(ChannelLocks::default().with(Capability::Listen, AccessRule::Except(deny)));

        let router = BroadcastRouter::new();
        for bypass in [false, true] {
            router.deliver_to(
                handles(&[&a, &b]),
                ChannelMessage::new("hi"),
                &channel,
                &SendContext::new().bypass_mute(bypass),
            );
        }

        assert!(a.inbox().is_empty());
        assert_eq!(b.inbox().len(), 2);
    }

    #[test]
    fn test_custom_policy() {
        let a = Arc::new(TestReceiver::new("A"));
        let b = Arc::new(TestReceiver::new("B"));
        let policy = |entity: &dyn Receiver, _channel: &Channel, _cap: Capability| {
            entity.id().as_str() == "B"
        };
        let router = BroadcastRouter::with_policy(Arc::new(policy));

        router.deliver_to(
            handles(&[&a, &b]),
            ChannelMessage::new("hi"),
            &Channel::new("C"),
            &SendContext::new(),
        );
        assert!(a.inbox().is_empty());
        assert_eq!(b.inbox().len(), 1);
    }

    #[test]
    fn test_veto_stops_everything() {
        let a = Arc::new(TestReceiver::new("A"));
        let counter = Arc::new(PostCounter::default());
        let router = BroadcastRouter::new()
            .with_hook(Arc::new(Veto))
            .with_hook(counter.clone());

        let report = router.deliver_to(
            handles(&[&a]),
            ChannelMessage::new("hi"),
            &Channel::new("C"),
            &SendContext::new(),
        );

        assert!(report.vetoed);
        assert_eq!(report.delivered, 0);
        assert!(a.inbox().is_empty());
        assert_eq!(a.post_calls(), 0);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_post_send_runs_once_after_delivery() {
        let a = Arc::new(TestReceiver::new("A"));
        let b = Arc::new(TestReceiver::new("B"));
        let counter = Arc::new(PostCounter::default());
        let router = BroadcastRouter::new().with_hook(counter.clone());

        router.deliver_to(
            handles(&[&a, &b]),
            ChannelMessage::new("hi"),
            &Channel::new("C"),
            &SendContext::new(),
        );

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(a.post_calls(), 1);
        assert_eq!(b.post_calls(), 1);
    }

    #[test]
    fn test_failing_receivers_do_not_block_others() {
        let erring = Arc::new(TestReceiver::new("Err").failing_pre());
        let panicking = Arc::new(TestReceiver::new("Panic").panicking_pre());
        let ok = Arc::new(TestReceiver::new("Ok"));

        let report = BroadcastRouter::new().deliver_to(
            handles(&[&erring, &panicking, &ok]),
            ChannelMessage::new("hi"),
            &Channel::new("C"),
            &SendContext::new(),
        );

        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(ok.inbox().len(), 1);
    }

    #[test]
    fn test_first_occurrence_wins_and_order_is_kept() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::new(TestReceiver::new("C").logging_to(&log));
        let a = Arc::new(TestReceiver::new("A").logging_to(&log));
        let x = Arc::new(TestReceiver::new("X").logging_to(&log));
        let b = Arc::new(TestReceiver::new("B").logging_to(&log));

        let report = BroadcastRouter::new().deliver_to(
            handles(&[&c, &a, &x, &c, &b, &a]),
            ChannelMessage::new("hi"),
            &Channel::new("Chan"),
            &SendContext::new(),
        );

        assert_eq!(report.candidates, 4);
        assert_eq!(*log.lock().unwrap(), vec!["C", "A", "X", "B"]);
    }

    #[test]
    fn test_failing_delivery_does_not_block_others() {
        let erring = Arc::new(TestReceiver::new("Err").failing_msg());
        let panicking = Arc::new(TestReceiver::new("Panic").panicking_msg());
        let ok = Arc::new(TestReceiver::new("Ok"));

        let report = BroadcastRouter::new().deliver_to(
            handles(&[&erring, &panicking, &ok]),
            ChannelMessage::new("hi"),
            &Channel::new("C"),
            &SendContext::new(),
        );

        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(erring.post_calls(), 0);
        assert_eq!(panicking.post_calls(), 0);
        assert_eq!(ok.inbox(), vec!["[C] hi".to_string()]);
    }

    #[test]
    fn test_failing_post_hook_still_counts_as_delivered() {
        let broken_post = Arc::new(TestReceiver::new("Post").failing_post());
        let ok = Arc::new(TestReceiver::new("Ok"));

        let report = BroadcastRouter::new().deliver_to(
            handles(&[&broken_post, &ok]),
            ChannelMessage::new("hi"),
            &Channel::new("C"),
            &SendContext::new(),
        );

        assert_eq!(report.delivered, 2);
        assert_eq!(report.post_failed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(broken_post.inbox(), vec!["[C] hi".to_string()]);
        assert_eq!(ok.inbox(), vec!["[C] hi".to_string()]);
        assert_eq!(ok.post_calls(), 1);
    }

    #[test]
    fn test_mixed_failures_across_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::new(TestReceiver::new("C").logging_to(&log));
        let a = Arc::new(TestReceiver::new("A").logging_to(&log));
        let x = Arc::new(TestReceiver::new("X").panicking_msg().logging_to(&log));
        let y = Arc::new(TestReceiver::new("Y").failing_post().logging_to(&log));
        let b = Arc::new(TestReceiver::new("B").logging_to(&log));

        let report = BroadcastRouter::new().deliver_to(
            handles(&[&c, &a, &x, &c, &y, &b, &a]),
            ChannelMessage::new("hi"),
            &Channel::new("Chan"),
            &SendContext::new(),
        );

        assert_eq!(report.candidates, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.post_failed, 1);
        assert_eq!(*log.lock().unwrap(), vec!["C", "A", "Y", "B"]);
    }

    #[test]
    fn test_receiver_can_skip_itself() {
        let quiet = Arc::new(TestReceiver::new("Quiet").dropping_pre());
        let ok = Arc::new(TestReceiver::new("Ok"));

        let report = BroadcastRouter::new().deliver_to(
            handles(&[&quiet, &ok]),
            ChannelMessage::new("hi"),
            &Channel::new("C"),
            &SendContext::new(),
        );

        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert!(quiet.inbox().is_empty());
        assert_eq!(quiet.post_calls(), 0);
        assert_eq!(ok.inbox().len(), 1);
    }

    #[test]
    fn test_senders_from_context_are_rendered() {
        let a = Arc::new(TestReceiver::new("A"));
        BroadcastRouter::new().deliver_to(
            handles(&[&a]),
            ChannelMessage::new("hi"),
            &Channel::new("Public"),
            &SendContext::new().with_sender("Bob"),
        );
        assert_eq!(a.inbox(), vec!["[Public] Bob: hi".to_string()]);
    }

    #[test]
    fn test_online_only_skips_disconnected() {
        let online = Arc::new(TestReceiver::new("On"));
        let offline = Arc::new(TestReceiver::new("Off").offline());
        let online_ref: ReceiverRef = online.clone();
        let offline_ref: ReceiverRef = offline.clone();

        let mut channel = Channel::new("C");
        channel.subscribe(&online_ref);
        channel.subscribe(&offline_ref);

        let router = BroadcastRouter::new();
        router.route(ChannelMessage::new("one"), &channel, &SendContext::new());
        assert_eq!(online.inbox().len(), 1);
        assert!(offline.inbox().is_empty());

        let channel = channel.with_online_only(false);
        router.route(ChannelMessage::new("two"), &channel, &SendContext::new());
        assert_eq!(offline.inbox().len(), 1);
    }
}
