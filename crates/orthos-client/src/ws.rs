//! WebSocket client for the fleet event stream

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use orthos_api::events::FleetEvent;

use crate::error::{ClientError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Receives live [`FleetEvent`]s from the daemon
///
/// Reconnects with exponential backoff when the connection drops. Events
/// emitted while disconnected are not replayed.
#[derive(Debug)]
pub struct WsClient {
    url: Url,
    receiver: mpsc::Receiver<FleetEvent>,
    task_handle: tokio::task::JoinHandle<()>,
}

impl WsClient {
    /// Connect to the event endpoint
    ///
    /// # Errors
    /// Returns an error if the URL is invalid.
    ///
    /// # Example
    /// ```no_run
    /// use orthos_api::events::FleetEvent;
    /// use orthos_client::WsClient;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let mut client = WsClient::connect("ws://localhost:8080/ws/events")?;
    ///
    /// while let Some(event) = client.recv().await {
    ///     if let FleetEvent::MachineStatusChanged { machine, from, to } = event {
    ///         println!("{machine}: {from} -> {to}");
    ///     }
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn connect(url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        let (tx, rx) = mpsc::channel(100);

        let task_url = url.clone();
        let task_handle = tokio::spawn(async move {
            connection_loop(task_url, tx).await;
        });

        Ok(Self {
            url,
            receiver: rx,
            task_handle,
        })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Next event; `None` once the background connection has given up
    pub async fn recv(&mut self) -> Option<FleetEvent> {
        self.receiver.recv().await
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

/// Reconnect delay: doubles per failed attempt, back to the floor after a
/// connection succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff(Duration);

impl Backoff {
    fn new() -> Self {
        Self(INITIAL_BACKOFF)
    }

    fn reset(&mut self) {
        self.0 = INITIAL_BACKOFF;
    }

    /// Delay to wait now; the following one is doubled
    fn advance(&mut self) -> Duration {
        let now = self.0;
        self.0 = (now * 2).min(MAX_BACKOFF);
        now
    }
}

async fn connection_loop(url: Url, tx: mpsc::Sender<FleetEvent>) {
    let mut backoff = Backoff::new();

    loop {
        let err = match stream_events(&url, &tx, &mut backoff).await {
            Ok(()) => {
                tracing::debug!("Event receiver dropped, closing WebSocket");
                return;
            }
            Err(e) => e,
        };
        let delay = backoff.advance();
        tracing::warn!(error = %err, retry_in = ?delay, "WebSocket disconnected");
        tokio::select! {
            () = sleep(delay) => {}
            () = tx.closed() => return,
        }
    }
}

/// Forward events until the connection ends
///
/// Returns `Ok(())` only when the local receiver is gone.
async fn stream_events(
    url: &Url,
    tx: &mpsc::Sender<FleetEvent>,
    backoff: &mut Backoff,
) -> Result<()> {
    let ws = |e: tokio_tungstenite::tungstenite::Error| ClientError::WebSocket(e.to_string());
    let (stream, _) = connect_async(url.as_str()).await.map_err(ws)?;
    tracing::info!(%url, "WebSocket connected");
    backoff.reset();

    let (_sink, mut frames) = stream.split();
    while let Some(frame) = frames.next().await {
        let text = match frame.map_err(ws)? {
            Message::Text(text) => text,
            Message::Close(reason) => {
                let reason = reason
                    .map_or_else(|| "no reason given".to_string(), |r| r.reason.to_string());
                return Err(ClientError::ConnectionClosed(reason));
            }
            _ => continue,
        };
        let Ok(event) = serde_json::from_str::<FleetEvent>(&text) else {
            tracing::warn!(len = text.len(), "Ignoring unparseable event");
            continue;
        };
        if tx.send(event).await.is_err() {
            return Ok(());
        }
    }

    Err(ClientError::ConnectionClosed("stream ended".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.advance(), Duration::from_secs(1));
        assert_eq!(backoff.advance(), Duration::from_secs(2));
        for _ in 0..10 {
            backoff.advance();
        }
        assert_eq!(backoff.advance(), MAX_BACKOFF);

        backoff.reset();
        assert_eq!(backoff, Backoff::new());
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = WsClient::connect("not a url").unwrap_err();
        assert!(matches!(err, ClientError::Url(_)));
    }

    #[tokio::test]
    async fn test_connect_is_lazy() {
        // nothing listens on the discard port
        let client = WsClient::connect("ws://127.0.0.1:9/ws/events").unwrap();
        assert_eq!(client.url().path(), "/ws/events");
    }
}
