use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use std::time::Duration;
use todo_core::{Notification, NotificationBackend, RelayMessage};
use tracing::warn;

#[derive(Deserialize)]
struct OkResponse<T> {
    ok: bool,
    data: Option<T>,
}

/// HTTP client for the background runner.
#[derive(Clone)]
pub struct RunnerClient {
    http: Client,
    base_url: String,
}

impl RunnerClient {
    pub fn new(base_url: &str) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_ok<T: DeserializeOwned>(res: reqwest::Response) -> anyhow::Result<T> {
        if !res.status().is_success() {
            anyhow::bail!("http_{}", res.status().as_u16());
        }
        let body: OkResponse<T> = res.json().await?;
        if !body.ok {
            anyhow::bail!("not_ok");
        }
        body.data.ok_or_else(|| anyhow::anyhow!("missing_data"))
    }

    pub async fn is_up(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn send(&self, msg: &RelayMessage) -> anyhow::Result<()> {
        let res = self.http.post(self.url("/relay")).json(msg).send().await?;
        Self::read_ok::<Value>(res).await.map(|_| ())
    }

    pub async fn poll(&self, view_id: &str) -> anyhow::Result<Vec<RelayMessage>> {
        let res = self
            .http
            .get(self.url("/relay/poll"))
            .query(&[("view_id", view_id)])
            .send()
            .await?;
        Self::read_ok(res).await
    }

    pub async fn show(&self, n: &Notification) -> anyhow::Result<bool> {
        #[derive(Deserialize)]
        struct ShowResult {
            shown: bool,
        }

        let res = self
            .http
            .post(self.url("/notifications/show"))
            .json(n)
            .send()
            .await?;
        Self::read_ok::<ShowResult>(res).await.map(|r| r.shown)
    }

    pub async fn subscribe_push(&self) -> anyhow::Result<Value> {
        let res = self.http.post(self.url("/push/subscribe")).send().await?;
        Self::read_ok(res).await
    }
}

pub fn print_notification(n: &Notification) {
    match n.data.id {
        Some(id) => println!("\u{1F514} {}: {} [{}]", n.title, n.body, id),
        None => println!("\u{1F514} {}: {}", n.title, n.body),
    }
}

/// Prints straight to the terminal; used by one-shot commands.
pub struct TerminalBackend;

impl NotificationBackend for TerminalBackend {
    fn show(&self, n: &Notification) -> anyhow::Result<()> {
        print_notification(n);
        Ok(())
    }
}

/// Hands notifications to the runner so they surface on the desktop, falling
/// back to the terminal when the runner cannot be reached.
pub struct RunnerBackend {
    client: RunnerClient,
}

impl RunnerBackend {
    pub fn new(client: RunnerClient) -> Self {
        Self { client }
    }
}

impl NotificationBackend for RunnerBackend {
    fn show(&self, n: &Notification) -> anyhow::Result<()> {
        let client = self.client.clone();
        let n = n.clone();
        tokio::spawn(async move {
            if let Err(e) = client.show(&n).await {
                warn!("runner unreachable ({e}); showing locally");
                print_notification(&n);
            }
        });
        Ok(())
    }
}
