use crate::state::{Action, FormSubmission, SessionState, reduce};
use lru::LruCache;
use parking_lot::Mutex;
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_SESSION_CAPACITY: usize = 4096;
const SESSION_ID_LEN: usize = 24;

/// Result of [`SessionStore::try_submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Started(SessionState),
    AlreadyRunning(SessionState),
}

/// Per-visitor session states, bounded by least-recent use.
#[derive(Clone)]
pub struct SessionStore {
    shared: Arc<Mutex<LruCache<String, SessionState>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY)
    }
}

impl SessionStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            shared: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Returns the session for `id`, or starts a fresh one under a new id when
    /// `id` is missing, malformed, or unknown (expired or evicted).
    pub fn ensure(&self, id: Option<&str>) -> (String, SessionState) {
        let mut guard = self.shared.lock();
        if let Some(id) = id.filter(|id| is_valid_session_id(id)) {
            if let Some(state) = guard.get(id) {
                return (id.to_string(), state.clone());
            }
        }
        let id = generate_session_id();
        let state = SessionState::default();
        if let Some((evicted, _)) = guard.push(id.clone(), state.clone()) {
            debug!(session = %evicted, "evicted least recently used session");
        }
        (id, state)
    }

    pub fn snapshot(&self, id: &str) -> Option<SessionState> {
        self.shared.lock().get(id).cloned()
    }

    /// Applies `action` to the session and returns the new state. `None` when
    /// the session no longer exists.
    pub fn dispatch(&self, id: &str, action: Action) -> Option<SessionState> {
        let mut guard = self.shared.lock();
        let state = guard.get_mut(id)?;
        let next = reduce(std::mem::take(state), action);
        *state = next.clone();
        Some(next)
    }

    /// Starts a generation unless one is already running, checking and
    /// submitting under one lock. `None` when the session no longer exists.
    pub fn try_submit(&self, id: &str, submission: FormSubmission) -> Option<SubmitOutcome> {
        let mut guard = self.shared.lock();
        let state = guard.get_mut(id)?;
        if state.generating {
            return Some(SubmitOutcome::AlreadyRunning(state.clone()));
        }
        let next = reduce(std::mem::take(state), Action::Submit(submission));
        *state = next.clone();
        Some(SubmitOutcome::Started(next))
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().is_empty()
    }
}

pub fn generate_session_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

fn is_valid_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;

    #[test]
    fn ensure_reuses_known_sessions() {
        let store = SessionStore::new(8);
        let (id, state) = store.ensure(None);
        assert_eq!(state, SessionState::default());
        store.dispatch(&id, Action::Navigate(Page::Roadmap)).unwrap();
        let (again, state) = store.ensure(Some(&id));
        assert_eq!(again, id);
        assert_eq!(state.current_page, Page::Roadmap);
    }

    #[test]
    fn unknown_or_malformed_ids_get_fresh_sessions() {
        let store = SessionStore::new(8);
        let (id, _) = store.ensure(Some("not-a-session"));
        assert_ne!(id, "not-a-session");
        assert_eq!(id.len(), SESSION_ID_LEN);
        let unknown = "A".repeat(SESSION_ID_LEN);
        let (id, _) = store.ensure(Some(&unknown));
        assert_ne!(id, unknown);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn sessions_are_isolated() {
        let store = SessionStore::new(8);
        let (a, _) = store.ensure(None);
        let (b, _) = store.ensure(None);
        store.dispatch(&a, Action::Navigate(Page::Pricing));
        assert_eq!(store.snapshot(&a).unwrap().current_page, Page::Pricing);
        assert_eq!(store.snapshot(&b).unwrap().current_page, Page::Home);
    }

    #[test]
    fn least_recently_used_session_is_evicted() {
        let store = SessionStore::new(2);
        let (first, _) = store.ensure(None);
        let (second, _) = store.ensure(None);
        store.snapshot(&first);
        let (_third, _) = store.ensure(None);
        assert_eq!(store.len(), 2);
        assert!(store.snapshot(&first).is_some());
        assert!(store.snapshot(&second).is_none());
        assert!(store.dispatch(&second, Action::ToggleTheme).is_none());
    }

    fn submission() -> FormSubmission {
        FormSubmission::new("AI tutoring app", "Launch in Mumbai").unwrap()
    }

    #[test]
    fn try_submit_refuses_while_generating() {
        let store = SessionStore::new(8);
        let (id, _) = store.ensure(None);
        match store.try_submit(&id, submission()) {
            Some(SubmitOutcome::Started(state)) => {
                assert!(state.generating);
                assert_eq!(state.current_page, Page::Segment);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            store.try_submit(&id, submission()),
            Some(SubmitOutcome::AlreadyRunning(_))
        ));
        store.dispatch(&id, Action::GenerationFinished);
        assert!(matches!(
            store.try_submit(&id, submission()),
            Some(SubmitOutcome::Started(_))
        ));
        assert!(store.try_submit("missing", submission()).is_none());
    }

    #[test]
    fn parallel_submits_start_exactly_one_generation() {
        let store = SessionStore::new(8);
        let (id, _) = store.ensure(None);
        let started = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| store.try_submit(&id, submission())))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|outcome| matches!(outcome, Some(SubmitOutcome::Started(_))))
                .count()
        });
        assert_eq!(started, 1);
    }

    #[test]
    fn zero_capacity_still_holds_one_session() {
        let store = SessionStore::new(0);
        let (id, _) = store.ensure(None);
        assert!(store.snapshot(&id).is_some());
    }

    #[test]
    fn generated_ids_are_alphanumeric() {
        let id = generate_session_id();
        assert!(is_valid_session_id(&id));
        assert_ne!(id, generate_session_id());
    }
}
