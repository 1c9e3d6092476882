use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use todo_core::{Notification, NotificationData, TodoError};
use tracing::info;

const FALLBACK_TITLE: &str = "Notification";
const NO_DETAILS: &str = "No details available";
const NO_CONTENT: &str = "No content";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Opaque registration handed to the push server. Nothing here is verified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

pub fn new_subscription(public_url: &str, now: OffsetDateTime) -> PushSubscription {
    let nanos = now.unix_timestamp_nanos();
    PushSubscription {
        endpoint: format!("{}/push?sub={:x}", public_url.trim_end_matches('/'), nanos),
        keys: PushKeys {
            p256dh: format!("{:032x}", nanos.rotate_left(17)),
            auth: format!("{:016x}", (nanos as u64) ^ 0x5bd1_e995),
        },
    }
}

/// Hands the subscription to the remote push server, if one is configured.
/// Failures are returned for logging; callers never retry.
pub async fn send_to_server(
    client: &reqwest::Client,
    server: Option<&str>,
    sub: &PushSubscription,
) -> Result<(), TodoError> {
    let Some(server) = server else {
        info!("no push server configured; subscription kept locally");
        return Ok(());
    };
    let res = client
        .post(server)
        .json(sub)
        .send()
        .await
        .map_err(|e| TodoError::Subscription(e.to_string()))?;
    if !res.status().is_success() {
        return Err(TodoError::Subscription(format!(
            "http_{}",
            res.status().as_u16()
        )));
    }
    info!("push subscription sent to {server}");
    Ok(())
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    data: Option<NotificationData>,
}

/// Turns a raw push body into a notification. JSON payloads supply their own
/// fields; anything else is shown verbatim.
pub fn parse_push_payload(raw: &[u8]) -> Notification {
    match serde_json::from_slice::<PushPayload>(raw) {
        Ok(p) => Notification::new(
            p.title.unwrap_or_else(|| FALLBACK_TITLE.to_string()),
            p.body.unwrap_or_else(|| NO_DETAILS.to_string()),
            p.data.unwrap_or_default(),
        ),
        Err(_) => {
            let text = String::from_utf8_lossy(raw);
            let body = if text.trim().is_empty() {
                NO_CONTENT.to_string()
            } else {
                text.into_owned()
            };
            Notification::new(FALLBACK_TITLE, body, NotificationData::default())
        }
    }
}
