use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Credentials for one remote server, held in memory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub username: String,
    pub password: String,
    pub certificate_password: String,
    pub certificate_path: Option<String>,
    pub use_hardware_token: bool,
}

/// Per-URL slot state. Exactly one slot exists per remote URL at a time.
#[derive(Debug, Clone)]
enum CredentialSlot {
    /// A prompt is outstanding and has not been answered.
    Pending,
    /// The user completed the prompt.
    Ready(CredentialRecord),
    /// The user declined the prompt. Consumed (removed) on first read so a
    /// later request gets a fresh prompt.
    Cancelled,
}

/// Outcome of a credential resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ready(CredentialRecord),
    Cancelled,
    TimedOut,
}

/// Signal sink for "credentials needed" events. The external UI collaborator
/// implements this; the broker never renders anything itself.
pub trait CredentialPrompt: Send + Sync {
    fn request(&self, remote_url: &str, database: &str);
}

/// In-memory, server-keyed credential store with interactive resolution.
///
/// Resolution polls the slot at a fixed interval rather than waiting on a
/// channel: the answering side is an arbitrary external collaborator (UI,
/// HTTP adapter, test) and polling keeps the contract to "write the slot".
pub struct CredentialBroker {
    slots: Mutex<HashMap<String, CredentialSlot>>,
    prompt: Box<dyn CredentialPrompt>,
    poll_interval: Duration,
    expiry: Duration,
}

impl CredentialBroker {
    pub fn new(prompt: Box<dyn CredentialPrompt>, poll_interval: Duration, expiry: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            prompt,
            poll_interval,
            expiry,
        }
    }

    /// Resolves credentials for `remote_url`, prompting interactively when
    /// none are stored.
    ///
    /// Only the caller that installs the Pending marker emits the prompt
    /// signal, so concurrent resolutions for the same URL share one prompt.
    /// A Cancelled slot is consumed before returning; a timeout removes any
    /// Pending marker it left behind.
    pub async fn resolve(&self, remote_url: &str, database: &str) -> Resolution {
        let deadline = Instant::now() + self.expiry;

        loop {
            let prompt_needed = {
                let mut slots = self.slots.lock().expect("credential slot lock poisoned");
                match slots.get(remote_url) {
                    Some(CredentialSlot::Ready(record)) => {
                        return Resolution::Ready(record.clone());
                    }
                    Some(CredentialSlot::Cancelled) => {
                        slots.remove(remote_url);
                        return Resolution::Cancelled;
                    }
                    Some(CredentialSlot::Pending) => false,
                    None => {
                        slots.insert(remote_url.to_string(), CredentialSlot::Pending);
                        true
                    }
                }
            };

            if prompt_needed {
                tracing::info!(url = remote_url, database, "requesting credentials");
                self.prompt.request(remote_url, database);
            }

            if Instant::now() >= deadline {
                let mut slots = self.slots.lock().expect("credential slot lock poisoned");
                if matches!(slots.get(remote_url), Some(CredentialSlot::Pending)) {
                    slots.remove(remote_url);
                }
                tracing::warn!(url = remote_url, "credential prompt expired");
                return Resolution::TimedOut;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stores completed credentials, replacing any Pending marker.
    pub fn store(&self, remote_url: &str, record: CredentialRecord) {
        let mut slots = self.slots.lock().expect("credential slot lock poisoned");
        slots.insert(remote_url.to_string(), CredentialSlot::Ready(record));
    }

    /// Records an explicit user cancellation for an outstanding prompt.
    pub fn cancel(&self, remote_url: &str) {
        let mut slots = self.slots.lock().expect("credential slot lock poisoned");
        slots.insert(remote_url.to_string(), CredentialSlot::Cancelled);
    }

    /// Drops the cached record for one URL, e.g. after the remote rejected
    /// it as stale.
    pub fn clear(&self, remote_url: &str) {
        let mut slots = self.slots.lock().expect("credential slot lock poisoned");
        slots.remove(remote_url);
    }

    /// Operator-initiated "forget everything".
    pub fn clear_all(&self) {
        let mut slots = self.slots.lock().expect("credential slot lock poisoned");
        slots.clear();
    }

    /// Whether a record is currently stored for the URL (Pending and
    /// Cancelled markers do not count).
    pub fn has_credentials(&self, remote_url: &str) -> bool {
        let slots = self.slots.lock().expect("credential slot lock poisoned");
        matches!(slots.get(remote_url), Some(CredentialSlot::Ready(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPrompt(Arc<AtomicUsize>);

    impl CredentialPrompt for CountingPrompt {
        fn request(&self, _remote_url: &str, _database: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoopPrompt;

    impl CredentialPrompt for NoopPrompt {
        fn request(&self, _remote_url: &str, _database: &str) {}
    }

    fn record() -> CredentialRecord {
        CredentialRecord {
            username: "user@example.com".into(),
            password: "pw".into(),
            certificate_password: "certpw".into(),
            certificate_path: Some("/certs/user.p12".into()),
            use_hardware_token: false,
        }
    }

    fn counting_broker(expiry_ms: u64) -> (Arc<CredentialBroker>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let broker = Arc::new(CredentialBroker::new(
            Box::new(CountingPrompt(count.clone())),
            Duration::from_millis(10),
            Duration::from_millis(expiry_ms),
        ));
        (broker, count)
    }

    #[tokio::test]
    async fn stored_credentials_resolve_without_prompt() {
        let (broker, count) = counting_broker(500);
        broker.store("https://x", record());

        let resolution = broker.resolve("https://x", "db").await;
        assert_eq!(resolution, Resolution::Ready(record()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_resolves_trigger_exactly_one_prompt() {
        let (broker, count) = counting_broker(2_000);

        let a = tokio::spawn({
            let broker = broker.clone();
            async move { broker.resolve("https://x", "db").await }
        });
        let b = tokio::spawn({
            let broker = broker.clone();
            async move { broker.resolve("https://x", "db").await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.store("https://x", record());

        assert_eq!(a.await.unwrap(), Resolution::Ready(record()));
        assert_eq!(b.await.unwrap(), Resolution::Ready(record()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_is_consumed_so_retry_prompts_again() {
        let (broker, count) = counting_broker(2_000);

        let resolving = tokio::spawn({
            let broker = broker.clone();
            async move { broker.resolve("https://x", "db").await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.cancel("https://x");

        assert_eq!(resolving.await.unwrap(), Resolution::Cancelled);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The marker is gone, so a second resolve starts a fresh prompt.
        let resolving = tokio::spawn({
            let broker = broker.clone();
            async move { broker.resolve("https://x", "db").await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.store("https://x", record());

        assert_eq!(resolving.await.unwrap(), Resolution::Ready(record()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_leaves_no_pending_marker() {
        let broker = CredentialBroker::new(
            Box::new(NoopPrompt),
            Duration::from_millis(10),
            Duration::from_millis(60),
        );

        let resolution = broker.resolve("https://x", "db").await;
        assert_eq!(resolution, Resolution::TimedOut);

        let slots = broker.slots.lock().unwrap();
        assert!(!slots.contains_key("https://x"));
    }

    #[tokio::test]
    async fn clear_purges_a_single_url() {
        let broker = CredentialBroker::new(
            Box::new(NoopPrompt),
            Duration::from_millis(10),
            Duration::from_millis(60),
        );
        broker.store("https://a", record());
        broker.store("https://b", record());

        broker.clear("https://a");

        assert!(!broker.has_credentials("https://a"));
        assert!(broker.has_credentials("https://b"));
    }

    #[tokio::test]
    async fn clear_all_forgets_everything() {
        let broker = CredentialBroker::new(
            Box::new(NoopPrompt),
            Duration::from_millis(10),
            Duration::from_millis(60),
        );
        broker.store("https://a", record());
        broker.store("https://b", record());

        broker.clear_all();

        assert!(!broker.has_credentials("https://a"));
        assert!(!broker.has_credentials("https://b"));
    }
}
