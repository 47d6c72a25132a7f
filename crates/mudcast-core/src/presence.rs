//! Presence watching for mudcast.
//!
//! Observers register interest in other entities' connection changes; subjects
//! may hide their own changes from everyone but a permitted few. On every
//! connect or disconnect the engine walks the connected entities once and
//! tells each entitled observer.

use crate::attributes::{
    load_or, AttributeError, AttributeStore, MemoryAttributes, WATCH_ACTIVE, WATCH_ALL,
    WATCH_HIDDEN, WATCH_LIST, WATCH_PERMITTED,
};
use crate::entity::{Directory, EntityId, Receiver, ReceiverRef};
use crate::hooks::panic_message;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// A connection state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    /// The subject came online.
    Connect,
    /// The subject went offline.
    Disconnect,
}

impl Transition {
    /// Phrase used in the notification text.
    #[must_use]
    pub fn status_text(&self) -> &'static str {
        match self {
            Transition::Connect => "connected to",
            Transition::Disconnect => "disconnected from",
        }
    }
}

/// What an observer watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSpec {
    /// Whether the observer receives notifications at all.
    pub watch_active: bool,
    /// Watch every subject.
    pub watch_all: bool,
    /// Explicitly watched subjects.
    pub watch_list: BTreeSet<EntityId>,
}

impl Default for WatchSpec {
    fn default() -> Self {
        Self {
            watch_active: true,
            watch_all: false,
            watch_list: BTreeSet::new(),
        }
    }
}

impl WatchSpec {
    /// Read an observer's spec, using defaults for unset attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or an attribute is malformed.
    pub fn load(store: &dyn AttributeStore, observer: &EntityId) -> Result<Self, AttributeError> {
        Ok(Self {
            watch_active: load_or(store, observer, WATCH_ACTIVE, true)?,
            watch_all: load_or(store, observer, WATCH_ALL, false)?,
            watch_list: load_or(store, observer, WATCH_LIST, BTreeSet::new())?,
        })
    }

    /// Write the spec back.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be encoded.
    pub fn save(&self, store: &MemoryAttributes, observer: &EntityId) -> Result<(), AttributeError> {
        store.set(observer, WATCH_ACTIVE, &self.watch_active)?;
        store.set(observer, WATCH_ALL, &self.watch_all)?;
        store.set(observer, WATCH_LIST, &self.watch_list)
    }

    /// Load, modify, and save in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or saving fails.
    pub fn update(
        store: &MemoryAttributes,
        observer: &EntityId,
        f: impl FnOnce(&mut WatchSpec),
    ) -> Result<Self, AttributeError> {
        let mut spec = Self::load(store, observer)?;
        f(&mut spec);
        spec.save(store, observer)?;
        Ok(spec)
    }

    /// Whether this spec asks about `subject`, ignoring hiding.
    #[must_use]
    pub fn watches(&self, subject: &EntityId) -> bool {
        self.watch_all || self.watch_list.contains(subject)
    }
}

/// How a subject exposes its own connection changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilitySpec {
    /// Hide connection changes.
    pub watch_hidden: bool,
    /// Observers exempt from hiding.
    pub watch_permitted: BTreeSet<EntityId>,
}

impl VisibilitySpec {
    /// Hidden from everyone.
    #[must_use]
    pub fn concealed() -> Self {
        Self {
            watch_hidden: true,
            watch_permitted: BTreeSet::new(),
        }
    }

    /// Read a subject's spec, using defaults for unset attributes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or an attribute is malformed.
    pub fn load(store: &dyn AttributeStore, subject: &EntityId) -> Result<Self, AttributeError> {
        Ok(Self {
            watch_hidden: load_or(store, subject, WATCH_HIDDEN, false)?,
            watch_permitted: load_or(store, subject, WATCH_PERMITTED, BTreeSet::new())?,
        })
    }

    /// Write the spec back.
    ///
    /// # Errors
    ///
    /// Returns an error if a value cannot be encoded.
    pub fn save(&self, store: &MemoryAttributes, subject: &EntityId) -> Result<(), AttributeError> {
        store.set(subject, WATCH_HIDDEN, &self.watch_hidden)?;
        store.set(subject, WATCH_PERMITTED, &self.watch_permitted)
    }

    /// Load, modify, and save in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or saving fails.
    pub fn update(
        store: &MemoryAttributes,
        subject: &EntityId,
        f: impl FnOnce(&mut VisibilitySpec),
    ) -> Result<Self, AttributeError> {
        let mut spec = Self::load(store, subject)?;
        f(&mut spec);
        spec.save(store, subject)?;
        Ok(spec)
    }

    /// The restriction in force: `None` when not hidden.
    #[must_use]
    pub fn permitted(&self) -> Option<&BTreeSet<EntityId>> {
        self.watch_hidden.then_some(&self.watch_permitted)
    }
}

/// Watch settings edits used by command handlers.
///
/// Every method fails with [`AttributeError`] if the stored record is
/// malformed or the new value cannot be encoded.
impl MemoryAttributes {
    /// Add `subject` to the observer's watch list. Returns `false` if it was
    /// already there.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch record cannot be read or written.
    pub fn watch(&self, observer: &EntityId, subject: &EntityId) -> Result<bool, AttributeError> {
        let mut added = false;
        WatchSpec::update(self, observer, |w| added = w.watch_list.insert(subject.clone()))?;
        Ok(added)
    }

    /// Remove `subject` from the observer's watch list. Returns `false` if it
    /// was not there.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch record cannot be read or written.
    pub fn unwatch(&self, observer: &EntityId, subject: &EntityId) -> Result<bool, AttributeError> {
        let mut removed = false;
        WatchSpec::update(self, observer, |w| removed = w.watch_list.remove(subject))?;
        Ok(removed)
    }

    /// Turn watching every connection on or off.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch record cannot be read or written.
    pub fn set_watch_all(&self, observer: &EntityId, enabled: bool) -> Result<(), AttributeError> {
        WatchSpec::update(self, observer, |w| w.watch_all = enabled).map(|_| ())
    }

    /// Turn all watch notices for the observer on or off.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch record cannot be read or written.
    pub fn set_watch_active(&self, observer: &EntityId, enabled: bool) -> Result<(), AttributeError> {
        WatchSpec::update(self, observer, |w| w.watch_active = enabled).map(|_| ())
    }

    /// Hide the subject from everyone not on its permitted list.
    ///
    /// # Errors
    ///
    /// Returns an error if the visibility record cannot be read or written.
    pub fn set_hidden(&self, subject: &EntityId, hidden: bool) -> Result<(), AttributeError> {
        VisibilitySpec::update(self, subject, |v| v.watch_hidden = hidden).map(|_| ())
    }

    /// Let `observer` see the subject while hidden. Returns `false` if it was
    /// already permitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the visibility record cannot be read or written.
    pub fn permit(&self, subject: &EntityId, observer: &EntityId) -> Result<bool, AttributeError> {
        let mut added = false;
        VisibilitySpec::update(self, subject, |v| {
            added = v.watch_permitted.insert(observer.clone());
        })?;
        Ok(added)
    }

    /// Take `observer` off the subject's permitted list. Returns `false` if it
    /// was not there.
    ///
    /// # Errors
    ///
    /// Returns an error if the visibility record cannot be read or written.
    pub fn unpermit(&self, subject: &EntityId, observer: &EntityId) -> Result<bool, AttributeError> {
        let mut removed = false;
        VisibilitySpec::update(self, subject, |v| removed = v.watch_permitted.remove(observer))?;
        Ok(removed)
    }
}

/// One connect or disconnect of a subject.
#[derive(Clone, Copy)]
pub struct ConnectionEvent<'a> {
    /// Entity whose connection changed.
    pub subject: &'a dyn Receiver,
    /// What happened.
    pub transition: Transition,
}

impl<'a> ConnectionEvent<'a> {
    /// Create an event.
    #[must_use]
    pub fn new(subject: &'a dyn Receiver, transition: Transition) -> Self {
        Self {
            subject,
            transition,
        }
    }

    /// Text sent to observers.
    #[must_use]
    pub fn text(&self) -> String {
        format!(
            "{} has {} the game.",
            self.subject.display_name(),
            self.transition.status_text()
        )
    }
}

/// Delivers connect/disconnect notices to watching observers.
pub struct WatchEngine {
    store: Arc<dyn AttributeStore>,
    armed: AtomicBool,
}

impl WatchEngine {
    /// Create a stopped engine.
    #[must_use]
    pub fn new(store: Arc<dyn AttributeStore>) -> Self {
        Self {
            store,
            armed: AtomicBool::new(false),
        }
    }

    /// Arm the engine.
    pub fn start(&self) {
        if !self.armed.swap(true, Ordering::SeqCst) {
            info!("Watch engine started");
        }
    }

    /// Disarm the engine; `notify` becomes a no-op.
    pub fn stop(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            info!("Watch engine stopped");
        }
    }

    /// Whether the engine is armed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Get the attribute store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AttributeStore> {
        &self.store
    }

    /// A subject's visibility. Unreadable data hides the subject entirely.
    #[must_use]
    pub fn visibility(&self, subject: &EntityId) -> VisibilitySpec {
        VisibilitySpec::load(self.store.as_ref(), subject).unwrap_or_else(|e| {
            warn!(subject = %subject, error = %e, "Unreadable visibility, hiding subject");
            VisibilitySpec::concealed()
        })
    }

    /// Observers entitled to hear about `subject`, in enumeration order.
    #[must_use]
    pub fn recipients(&self, subject: &EntityId, observers: &[ReceiverRef]) -> Vec<ReceiverRef> {
        let visibility = self.visibility(subject);
        let permitted = visibility.permitted();

        observers
            .iter()
            .filter(|observer| observer.id() != subject)
            .filter(|observer| {
                let spec = match WatchSpec::load(self.store.as_ref(), observer.id()) {
                    Ok(spec) => spec,
                    Err(e) => {
                        debug!(observer = %observer.id(), error = %e, "Skipping observer");
                        return false;
                    }
                };
                if !spec.watch_active || !spec.watches(subject) {
                    return false;
                }
                permitted.map_or(true, |ids| ids.contains(observer.id()))
            })
            .cloned()
            .collect()
    }

    /// Tell every entitled observer about a subject's connection change.
    ///
    /// Returns the number of observers notified.
    pub fn notify(
        &self,
        subject: &dyn Receiver,
        transition: Transition,
        observers: &[ReceiverRef],
    ) -> usize {
        if !self.is_active() {
            return 0;
        }

        let event = ConnectionEvent::new(subject, transition);
        let text = event.text();
        let mut notified = 0;

        for observer in self.recipients(subject.id(), observers) {
            let result = panic::catch_unwind(AssertUnwindSafe(|| observer.msg(&text)));
            match result {
                Ok(Ok(())) => notified += 1,
                Ok(Err(e)) => {
                    warn!(observer = %observer.id(), error = %e, "Watch notice failed");
                }
                Err(payload) => {
                    warn!(
                        observer = %observer.id(),
                        panic = %panic_message(payload.as_ref()),
                        "Watch notice panicked"
                    );
                }
            }
        }

        trace!(
            subject = %subject.id(),
            transition = ?transition,
            notified,
            "Watch notices sent"
        );
        notified
    }

    /// [`notify`](Self::notify) against a directory snapshot.
    pub fn notify_directory(
        &self,
        subject: &dyn Receiver,
        transition: Transition,
        directory: &dyn Directory,
    ) -> usize {
        self.notify(subject, transition, &directory.connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestReceiver;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryAttributes>,
        engine: WatchEngine,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryAttributes::new());
            let engine = WatchEngine::new(store.clone());
            engine.start();
            Self { store, engine }
        }

        fn watch_all(&self, observer: &str) {
            WatchSpec::update(&self.store, &EntityId::new(observer), |s| s.watch_all = true)
                .unwrap();
        }

        fn watch(&self, observer: &str, subject: &str) {
            WatchSpec::update(&self.store, &EntityId::new(observer), |s| {
                s.watch_list.insert(EntityId::new(subject));
            })
            .unwrap();
        }

        fn hide(&self, subject: &str, permitted: &[&str]) {
            VisibilitySpec::update(&self.store, &EntityId::new(subject), |v| {
                v.watch_hidden = true;
                v.watch_permitted = permitted.iter().map(|p| EntityId::new(*p)).collect();
            })
            .unwrap();
        }
    }

    fn online(receivers: &[&Arc<TestReceiver>]) -> Vec<ReceiverRef> {
        receivers
            .iter()
            .map(|r| Arc::clone(*r) as ReceiverRef)
            .collect()
    }

    #[test]
    fn test_status_text() {
        assert_eq!(Transition::Connect.status_text(), "connected to");
        assert_eq!(Transition::Disconnect.status_text(), "disconnected from");
    }

    #[test]
    fn test_spec_defaults() {
        let store = MemoryAttributes::new();
        let id = EntityId::new("Nobody");
        let watch = WatchSpec::load(&store, &id).unwrap();
        assert_eq!(watch, WatchSpec::default());
        assert!(watch.watch_active);
        assert!(!watch.watch_all);

        let vis = VisibilitySpec::load(&store, &id).unwrap();
        assert!(vis.permitted().is_none());
    }

    #[test]
    fn test_connect_notifies_watchers() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let all = Arc::new(TestReceiver::new("Wendy"));
        let listed = Arc::new(TestReceiver::new("Lee"));
        let bystander = Arc::new(TestReceiver::new("Ann"));
        fx.watch_all("Wendy");
        fx.watch("Lee", "Sam");
        fx.watch("Ann", "Someone");

        let count = fx.engine.notify(
            &*subject,
            Transition::Connect,
            &online(&[&subject, &all, &listed, &bystander]),
        );

        assert_eq!(count, 2);
        assert_eq!(all.inbox(), vec!["Sam has connected to the game.".to_string()]);
        assert_eq!(listed.inbox(), vec!["Sam has connected to the game.".to_string()]);
        assert!(bystander.inbox().is_empty());
    }

    #[test]
    fn test_subject_never_notified_about_itself() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        fx.watch_all("Sam");

        let count = fx
            .engine
            .notify(&*subject, Transition::Connect, &online(&[&subject]));
        assert_eq!(count, 0);
        assert!(subject.inbox().is_empty());
    }

    #[test]
    fn test_inactive_observer_skipped() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let paused = Arc::new(TestReceiver::new("Wendy"));
        fx.watch_all("Wendy");
        WatchSpec::update(&fx.store, &EntityId::new("Wendy"), |s| s.watch_active = false)
            .unwrap();

        fx.engine
            .notify(&*subject, Transition::Connect, &online(&[&paused]));
        assert!(paused.inbox().is_empty());
    }

    #[test]
    fn test_hidden_subject_only_reaches_permitted() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let bob = Arc::new(TestReceiver::new("Bob"));
        let wendy = Arc::new(TestReceiver::new("Wendy"));
        fx.watch("Bob", "Sam");
        fx.watch_all("Wendy");
        fx.hide("Sam", &["Bob"]);

        let count = fx.engine.notify(
            &*subject,
            Transition::Disconnect,
            &online(&[&bob, &wendy]),
        );

        assert_eq!(count, 1);
        assert_eq!(
            bob.inbox(),
            vec!["Sam has disconnected from the game.".to_string()]
        );
        assert!(wendy.inbox().is_empty());
    }

    #[test]
    fn test_permitted_observer_still_needs_to_watch() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let bob = Arc::new(TestReceiver::new("Bob"));
        fx.hide("Sam", &["Bob"]);

        fx.engine
            .notify(&*subject, Transition::Connect, &online(&[&bob]));
        assert!(bob.inbox().is_empty());
    }

    #[test]
    fn test_hidden_with_no_permitted_beats_watch_all() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("S"));
        let watcher = Arc::new(TestReceiver::new("W"));
        fx.watch_all("W");
        fx.hide("S", &[]);

        let count = fx
            .engine
            .notify(&*subject, Transition::Connect, &online(&[&watcher]));
        assert_eq!(count, 0);
        assert!(watcher.inbox().is_empty());
    }

    #[test]
    fn test_corrupt_observer_is_skipped() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let broken = Arc::new(TestReceiver::new("Broken"));
        let fine = Arc::new(TestReceiver::new("Fine"));
        fx.store
            .set_raw(&EntityId::new("Broken"), WATCH_ALL, json!("yes please"));
        fx.watch_all("Fine");

        let count = fx.engine.notify(
            &*subject,
            Transition::Connect,
            &online(&[&broken, &fine]),
        );
        assert_eq!(count, 1);
        assert!(broken.inbox().is_empty());
        assert_eq!(fine.inbox().len(), 1);
    }

    #[test]
    fn test_corrupt_subject_visibility_hides_subject() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let wendy = Arc::new(TestReceiver::new("Wendy"));
        fx.watch_all("Wendy");
        fx.store
            .set_raw(&EntityId::new("Sam"), WATCH_PERMITTED, json!(42));

        let count = fx
            .engine
            .notify(&*subject, Transition::Connect, &online(&[&wendy]));
        assert_eq!(count, 0);
    }

    #[test]
    fn test_failing_observer_does_not_block_others() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let closed = Arc::new(TestReceiver::new("Closed").failing_msg());
        let open = Arc::new(TestReceiver::new("Open"));
        fx.watch_all("Closed");
        fx.watch_all("Open");

        let count = fx.engine.notify(
            &*subject,
            Transition::Connect,
            &online(&[&closed, &open]),
        );
        assert_eq!(count, 1);
        assert_eq!(open.inbox().len(), 1);
    }

    #[test]
    fn test_stopped_engine_is_silent() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let wendy = Arc::new(TestReceiver::new("Wendy"));
        fx.watch_all("Wendy");

        fx.engine.stop();
        assert!(!fx.engine.is_active());
        let count = fx
            .engine
            .notify(&*subject, Transition::Connect, &online(&[&wendy]));
        assert_eq!(count, 0);

        fx.engine.start();
        let count = fx
            .engine
            .notify(&*subject, Transition::Connect, &online(&[&wendy]));
        assert_eq!(count, 1);
    }

    #[test]
    fn test_notify_directory_uses_connected_only() {
        let fx = Fixture::new();
        let subject = Arc::new(TestReceiver::new("Sam"));
        let on = Arc::new(TestReceiver::new("On"));
        let off = Arc::new(TestReceiver::new("Off").offline());
        fx.watch_all("On");
        fx.watch_all("Off");

        let directory = online(&[&on, &off]);
        let count = fx
            .engine
            .notify_directory(&*subject, Transition::Connect, &directory);
        assert_eq!(count, 1);
        assert!(off.inbox().is_empty());
    }

    #[test]
    fn test_attribute_helpers() {
        let store = MemoryAttributes::new();
        let bob = EntityId::new("Bob");
        let sam = EntityId::new("Sam");

        assert!(store.watch(&bob, &sam).unwrap());
        assert!(!store.watch(&bob, &sam).unwrap());
        store.set_watch_all(&bob, true).unwrap();
        store.set_watch_active(&bob, false).unwrap();
        let watch = WatchSpec::load(&store, &bob).unwrap();
        assert!(watch.watches(&sam));
        assert!(watch.watch_all);
        assert!(!watch.watch_active);
        assert!(store.unwatch(&bob, &sam).unwrap());
        assert!(!store.unwatch(&bob, &sam).unwrap());

        store.set_hidden(&sam, true).unwrap();
        assert!(store.permit(&sam, &bob).unwrap());
        let vis = VisibilitySpec::load(&store, &sam).unwrap();
        assert!(vis.permitted().is_some_and(|p| p.contains(&bob)));
        assert!(store.unpermit(&sam, &bob).unwrap());
        assert!(VisibilitySpec::load(&store, &sam)
            .unwrap()
            .permitted()
            .is_some_and(BTreeSet::is_empty));
    }
}
