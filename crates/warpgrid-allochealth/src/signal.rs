//! Single-delivery signals.

use tokio::sync::watch;

/// A value that is published at most once and can be awaited by anyone.
///
/// Publishing after the first value is a silent no-op.
#[derive(Debug)]
pub struct Once<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone + Send + Sync> Once<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish `value` unless something was published already. Returns
    /// whether this call published.
    pub fn publish(&self, value: T) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    /// The published value, if any.
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait for the value to be published.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        let value = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        match value {
            Some(value) => value,
            // The sender lives as long as `self`.
            None => std::future::pending().await,
        }
    }
}

impl<T: Clone + Send + Sync> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn first_publish_wins() {
        let once = Once::new();
        assert_eq!(once.get(), None);
        assert!(once.publish(true));
        assert!(!once.publish(false));
        assert_eq!(once.get(), Some(true));
    }

    #[tokio::test]
    async fn wait_returns_already_published_value() {
        let once = Once::new();
        once.publish(7u32);
        assert_eq!(once.wait().await, 7);
    }

    #[tokio::test]
    async fn wait_wakes_on_publish() {
        let once = Arc::new(Once::new());
        let waiter = {
            let once = once.clone();
            tokio::spawn(async move { once.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        once.publish("done".to_string());
        assert_eq!(waiter.await.unwrap(), "done");
    }
}
