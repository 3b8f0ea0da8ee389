use super::Sink;
use crate::error::SinkError;
use async_trait::async_trait;
use tokio::sync::watch;
use vault_client::Credential;

/// Keeps the latest delivered credential for in-process consumers.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    latest: watch::Sender<Option<Credential>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            name: name.into(),
            latest,
        }
    }

    pub fn latest(&self) -> Option<Credential> {
        self.latest.borrow().clone()
    }

    /// Receiver that observes every write.
    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.latest.subscribe()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, credential: &Credential) -> Result<(), SinkError> {
        self.latest.send_replace(Some(credential.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_latest_and_subscribe() {
        let sink = MemorySink::new("cache");
        let mut rx = sink.subscribe();
        assert!(sink.latest().is_none());

        sink.write(&Credential::new("s.one", Duration::from_secs(5), false))
            .await
            .unwrap();

        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone().unwrap();
        assert_eq!(seen.token.expose(), "s.one");
        assert_eq!(sink.latest().unwrap().token.expose(), "s.one");
    }
}
