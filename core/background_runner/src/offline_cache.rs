use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use todo_core::TodoError;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CACHE_NAME: &str = "todolist-pwa-v1";

/// Everything that must be cached before the runner reports itself ready.
pub const STATIC_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/css/style.css",
    "/js/app.js",
    "/js/sw-register.js",
    "/js/notifications.js",
    "/manifest.json",
    "/images/icon-192x192.png",
    "/images/icon-512x512.png",
    "/images/favicon.ico",
];

/// Served for navigations when both the cache and the network miss.
pub const OFFLINE_ROOT: &str = "/index.html";
pub const OFFLINE_BODY: &str = "Content unavailable offline.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResource {
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

pub struct OfflineCache {
    conn: Connection,
    cache_name: String,
}

impl OfflineCache {
    pub fn open(path: &Path, cache_name: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        init_db(&conn)?;
        Ok(Self {
            conn,
            cache_name: cache_name.to_string(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(cache_name: &str) -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            conn,
            cache_name: cache_name.to_string(),
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn lookup(&self, path: &str) -> rusqlite::Result<Option<CachedResource>> {
        self.conn
            .query_row(
                "SELECT content_type, body FROM cache_entries WHERE cache_name = ?1 AND path = ?2",
                (self.cache_name.as_str(), path),
                |row| {
                    Ok(CachedResource {
                        content_type: row.get(0)?,
                        body: row.get(1)?,
                    })
                },
            )
            .optional()
    }

    /// Writes all entries or none of them.
    pub fn put_all(&mut self, entries: &[(String, CachedResource)]) -> rusqlite::Result<()> {
        let cached_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let tx = self.conn.transaction()?;
        for (path, res) in entries {
            tx.execute(
                r#"
INSERT INTO cache_entries (cache_name, path, content_type, body, cached_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(cache_name, path) DO UPDATE SET
  content_type=excluded.content_type,
  body=excluded.body,
  cached_at=excluded.cached_at
                "#,
                (
                    self.cache_name.as_str(),
                    path.as_str(),
                    res.content_type.as_str(),
                    res.body.as_slice(),
                    cached_at.as_str(),
                ),
            )?;
        }
        tx.commit()
    }

    /// Drops entries left behind by older cache names.
    pub fn activate(&self) -> rusqlite::Result<usize> {
        self.conn.execute(
            "DELETE FROM cache_entries WHERE cache_name <> ?1",
            [self.cache_name.as_str()],
        )
    }

    pub fn is_ready(&self) -> rusqlite::Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM cache_entries WHERE cache_name = ?1 AND path = ?2")?;
        for path in STATIC_ASSETS {
            if !stmt.exists((self.cache_name.as_str(), *path))? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS cache_entries (
  cache_name TEXT NOT NULL,
  path TEXT NOT NULL,
  content_type TEXT NOT NULL,
  body BLOB NOT NULL,
  cached_at TEXT NOT NULL,
  PRIMARY KEY (cache_name, path)
);
"#,
    )
}

pub async fn fetch_from_network(
    client: &reqwest::Client,
    origin: &str,
    path: &str,
) -> Result<NetworkResponse, TodoError> {
    let url = format!("{}{}", origin.trim_end_matches('/'), path);
    let res = client
        .get(&url)
        .send()
        .await
        .map_err(|e| TodoError::NetworkUnavailable(format!("{url}: {e}")))?;
    let status = res.status().as_u16();
    let content_type = res
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let body = res
        .bytes()
        .await
        .map_err(|e| TodoError::NetworkUnavailable(format!("{url}: {e}")))?;
    Ok(NetworkResponse {
        status,
        content_type,
        body: body.to_vec(),
    })
}

/// Fetches the whole manifest, then caches it in one go. Any failure leaves
/// the cache untouched.
pub async fn install(
    cache: &Mutex<OfflineCache>,
    client: &reqwest::Client,
    origin: &str,
) -> anyhow::Result<usize> {
    let mut fetched = Vec::with_capacity(STATIC_ASSETS.len());
    for path in STATIC_ASSETS {
        let res = fetch_from_network(client, origin, path).await?;
        if !(200..300).contains(&res.status) {
            anyhow::bail!("caching {path} failed: http_{}", res.status);
        }
        fetched.push((
            path.to_string(),
            CachedResource {
                content_type: res.content_type,
                body: res.body,
            },
        ));
    }

    let mut cache = cache.lock().await;
    cache.put_all(&fetched)?;
    let removed = cache.activate()?;
    info!(
        "cache {} installed: {} resources ({} stale removed)",
        cache.cache_name(),
        fetched.len(),
        removed
    );
    Ok(fetched.len())
}

#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Cached(CachedResource),
    Network(NetworkResponse),
    /// Network failed on a navigation; the cached root page stands in.
    OfflinePage(CachedResource),
    Unavailable,
}

/// Cache first, network second; offline navigations fall back to the root page.
pub async fn respond(
    cache: &Mutex<OfflineCache>,
    client: &reqwest::Client,
    origin: &str,
    path: &str,
    navigation: bool,
) -> FetchOutcome {
    let hit = { cache.lock().await.lookup(path) };
    match hit {
        Ok(Some(res)) => return FetchOutcome::Cached(res),
        Ok(None) => {}
        Err(err) => warn!("cache lookup for {path} failed: {err}"),
    }

    match fetch_from_network(client, origin, path).await {
        Ok(res) => FetchOutcome::Network(res),
        Err(err) => {
            warn!("fetch failed: {err}");
            if navigation {
                if let Ok(Some(page)) = cache.lock().await.lookup(OFFLINE_ROOT) {
                    return FetchOutcome::OfflinePage(page);
                }
            }
            FetchOutcome::Unavailable
        }
    }
}

pub fn is_navigation(headers: &HeaderMap) -> bool {
    let header_has = |name: &str, needle: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains(needle))
            .unwrap_or(false)
    };
    header_has("sec-fetch-mode", "navigate") || header_has("accept", "text/html")
}

fn body_response(status: StatusCode, content_type: &str, body: Vec<u8>) -> Response {
    let ct = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    (status, [(header::CONTENT_TYPE, ct)], body).into_response()
}

impl IntoResponse for FetchOutcome {
    fn into_response(self) -> Response {
        match self {
            FetchOutcome::Cached(res) | FetchOutcome::OfflinePage(res) => {
                body_response(StatusCode::OK, &res.content_type, res.body)
            }
            FetchOutcome::Network(res) => body_response(
                StatusCode::from_u16(res.status).unwrap_or(StatusCode::BAD_GATEWAY),
                &res.content_type,
                res.body,
            ),
            FetchOutcome::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                OFFLINE_BODY,
            )
                .into_response(),
        }
    }
}
