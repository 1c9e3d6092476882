mod offline_cache;
mod push;
mod relay_hub;
mod toast;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use clap::Parser;
use offline_cache::{OfflineCache, CACHE_NAME};
use relay_hub::{Delivery, RelayHub};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Instant,
};
use time::OffsetDateTime;
use todo_core::{
    kv::PUSH_SUBSCRIPTION_KEY,
    load_tasks,
    reminder::{due_soon_body, DUE_SOON_WINDOW_MINUTES, REMINDER_LEAD_MINUTES, REMINDER_TITLE, WAKE_INTERVAL_MINUTES},
    due_within_window, Dispatcher, KvStore, Notification, NotificationData, RelayMessage,
    ReminderScheduler, ScheduleOutcome, SqliteKv, Task, TaskId,
};
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 17700;
/// Upper bound for every minute-valued flag: one week.
const MAX_MINUTES: i64 = 7 * 24 * 60;

#[derive(Parser, Debug)]
#[command(name = "background_runner", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    #[arg(long, default_value = "127.0.0.1:17700")]
    listen: String,

    /// SQLite database path, shared with todo_view.
    #[arg(long, default_value = "./data/todo.db")]
    db: PathBuf,

    /// Origin the static resources are fetched from when not cached.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    origin: String,

    /// Cache name; bump it to replace every cached resource on next start.
    #[arg(long, default_value = CACHE_NAME)]
    cache_name: String,

    /// Periodic wake interval (minutes, 1 to 10080).
    #[arg(
        long,
        default_value_t = WAKE_INTERVAL_MINUTES,
        value_parser = clap::value_parser!(u64).range(1..=MAX_MINUTES as u64)
    )]
    wake_minutes: u64,

    /// A task due within this many minutes is reminded on wake (1 to 10080).
    #[arg(
        long,
        default_value_t = DUE_SOON_WINDOW_MINUTES,
        value_parser = clap::value_parser!(i64).range(1..=MAX_MINUTES)
    )]
    lead_window_minutes: i64,

    /// Minutes before the due time for the early reminder of scheduled tasks (1 to 10080).
    #[arg(
        long,
        default_value_t = REMINDER_LEAD_MINUTES,
        value_parser = clap::value_parser!(i64).range(1..=MAX_MINUTES)
    )]
    reminder_lead_minutes: i64,

    /// Remote endpoint receiving push subscriptions. Without it subscriptions stay local.
    #[arg(long)]
    push_server: Option<String>,

    /// Command that opens a view when a notification action arrives and none is open,
    /// e.g. "todo_view watch".
    #[arg(long)]
    view_command: Option<String>,
}

struct RunnerSettings {
    origin: String,
    public_url: String,
    due_soon_window: chrono::Duration,
    push_server: Option<String>,
    view_command: Option<String>,
}

#[derive(Clone)]
struct AppState {
    kv: Arc<dyn KvStore>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Mutex<ReminderScheduler>>,
    relay: Arc<Mutex<RelayHub>>,
    cache: Arc<Mutex<OfflineCache>>,
    http: reqwest::Client,
    settings: Arc<RunnerSettings>,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn err(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "background_runner=info,todo_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let addr = parse_listen(&args.listen)?;
    let public_url = format!("http://{addr}");

    let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&args.db)?);
    let cache = OfflineCache::open(&args.db, &args.cache_name)?;
    let dispatcher = Arc::new(Dispatcher::new(
        kv.clone(),
        Arc::new(toast::PlatformBackend::new(&public_url)),
    ));
    let scheduler = ReminderScheduler::new(kv.clone(), dispatcher.clone())
        .with_lead(chrono::Duration::minutes(args.reminder_lead_minutes));

    let state = AppState {
        kv,
        dispatcher,
        scheduler: Arc::new(Mutex::new(scheduler)),
        relay: Arc::new(Mutex::new(RelayHub::default())),
        cache: Arc::new(Mutex::new(cache)),
        http: reqwest::Client::new(),
        settings: Arc::new(RunnerSettings {
            origin: args.origin.clone(),
            public_url,
            due_soon_window: chrono::Duration::minutes(args.lead_window_minutes),
            push_server: args.push_server.clone(),
            view_command: args.view_command.clone(),
        }),
    };

    let wake_every = std::time::Duration::from_secs(args.wake_minutes * 60);
    tokio::spawn(periodic_wake(state.clone(), wake_every));

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = Router::new()
        .route("/health", get(health))
        .route("/relay", post(post_relay).options(options_ok))
        .route("/relay/poll", get(get_relay_poll))
        .route(
            "/notifications/show",
            post(post_notification_show).options(options_ok),
        )
        .route("/notifications/click", get(get_notification_click))
        .route("/push", post(post_push).options(options_ok))
        .route("/push/subscribe", post(post_push_subscribe).options(options_ok))
        .route("/sync/check-todos", post(post_check_todos).options(options_ok))
        .fallback(get_static)
        .with_state(state)
        .layer(cors);

    info!("Runner listening on http://{addr}");
    info!("DB: {}", args.db.display());
    info!("Origin: {}", args.origin);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
    cache_name: String,
    ready: bool,
    view_open: bool,
    pending_actions: usize,
}

async fn health(State(state): State<AppState>) -> Response {
    let (cache_name, ready) = {
        let cache = state.cache.lock().await;
        let ready = cache.is_ready().unwrap_or_else(|e| {
            error!("cache readiness check failed: {e}");
            false
        });
        (cache.cache_name().to_string(), ready)
    };
    let (view_open, pending_actions) = {
        let hub = state.relay.lock().await;
        (hub.has_live_view(Instant::now()), hub.pending_len())
    };
    ok(HealthInfo {
        service: "background_runner",
        version: env!("CARGO_PKG_VERSION"),
        cache_name,
        ready,
        view_open,
        pending_actions,
    })
}

async fn periodic_wake(state: AppState, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        // The first tick completes immediately, so install runs at startup.
        ticker.tick().await;
        on_wake(&state).await;
    }
}

async fn on_wake(state: &AppState) {
    let ready = { state.cache.lock().await.is_ready().unwrap_or(false) };
    if !ready {
        if let Err(e) =
            offline_cache::install(&state.cache, &state.http, &state.settings.origin).await
        {
            warn!("offline cache not installed yet: {e}");
        }
    }
    let fired = check_todos(state);
    info!("wake: {fired} due-soon reminders shown");
}

/// Incomplete tasks due inside the window, in storage order.
fn due_soon_tasks(tasks: &[Task], now: chrono::DateTime<Utc>, window: chrono::Duration) -> Vec<&Task> {
    tasks
        .iter()
        .filter(|t| !t.completed)
        .filter(|t| matches!(t.due_date, Some(due) if due_within_window(due, now, window)))
        .collect()
}

fn check_todos(state: &AppState) -> usize {
    let tasks = load_tasks(state.kv.as_ref());
    due_soon_tasks(&tasks, Utc::now(), state.settings.due_soon_window)
        .into_iter()
        .filter(|t| {
            state.dispatcher.show(
                REMINDER_TITLE,
                &due_soon_body(&t.text),
                NotificationData::for_task(t.id),
            )
        })
        .count()
}

#[derive(Serialize)]
struct CheckResult {
    fired: usize,
}

async fn post_check_todos(State(state): State<AppState>) -> Response {
    ok(CheckResult {
        fired: check_todos(&state),
    })
}

#[derive(Serialize)]
struct RelayResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    delivered_to: Option<String>,
    pending: bool,
}

async fn relay_to_view(state: &AppState, msg: RelayMessage) -> RelayResult {
    let now = Instant::now();
    let (delivery, launch) = {
        let mut hub = state.relay.lock().await;
        let delivery = hub.deliver(msg, now);
        let launch = delivery == Delivery::Pending && hub.should_launch(now);
        (delivery, launch)
    };
    if launch {
        match state.settings.view_command.as_deref() {
            Some(cmd) => launch_view(cmd),
            None => info!("no view open; action parked until one polls"),
        }
    }
    match delivery {
        Delivery::Queued(view_id) => RelayResult {
            delivered_to: Some(view_id),
            pending: false,
        },
        Delivery::Pending => RelayResult {
            delivered_to: None,
            pending: true,
        },
    }
}

fn launch_view(command: &str) {
    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        return;
    };
    // No terminal to hand over; the view keeps polling once its input closes.
    match tokio::process::Command::new(program)
        .args(parts)
        .stdin(Stdio::null())
        .spawn()
    {
        Ok(child) => info!("launched view: {command} (pid {:?})", child.id()),
        Err(e) => error!("launching view '{command}' failed: {e}"),
    }
}

#[derive(Serialize)]
struct ScheduleResult {
    task_id: TaskId,
    armed: usize,
}

async fn post_relay(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let msg: RelayMessage = match serde_json::from_value(payload) {
        Ok(v) => v,
        Err(_) => return err(StatusCode::BAD_REQUEST, "invalid_message"),
    };

    match msg {
        RelayMessage::ScheduleNotification { task } => {
            let outcome = state
                .scheduler
                .lock()
                .await
                .schedule_task(&task, Utc::now());
            let armed = match outcome {
                ScheduleOutcome::Armed(n) => n,
                ScheduleOutcome::Skipped => 0,
            };
            info!(task_id = %task.id, "schedule request: {armed} timers armed");
            ok(ScheduleResult {
                task_id: task.id,
                armed,
            })
        }
        msg @ RelayMessage::NotificationAction { .. } => ok(relay_to_view(&state, msg).await),
    }
}

#[derive(Deserialize)]
struct PollQuery {
    view_id: String,
}

async fn get_relay_poll(State(state): State<AppState>, Query(q): Query<PollQuery>) -> Response {
    if q.view_id.trim().is_empty() {
        return err(StatusCode::BAD_REQUEST, "missing_view_id");
    }
    let messages = state.relay.lock().await.poll(&q.view_id, Instant::now());
    ok(messages)
}

#[derive(Serialize)]
struct ShowResult {
    shown: bool,
}

async fn post_notification_show(
    State(state): State<AppState>,
    Json(n): Json<Notification>,
) -> Response {
    ok(ShowResult {
        shown: state.dispatcher.show_notification(&n),
    })
}

#[derive(Deserialize)]
struct ClickQuery {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    id: Option<i64>,
}

async fn get_notification_click(
    State(state): State<AppState>,
    Query(q): Query<ClickQuery>,
) -> Response {
    let data = NotificationData {
        id: q.id.map(TaskId),
    };
    match state.dispatcher.interact(q.action.as_deref(), &data) {
        Some(msg) => ok(relay_to_view(&state, msg).await),
        None => ok(RelayResult {
            delivered_to: None,
            pending: false,
        }),
    }
}

async fn post_push(State(state): State<AppState>, body: Bytes) -> Response {
    let n = push::parse_push_payload(&body);
    ok(ShowResult {
        shown: state.dispatcher.show_notification(&n),
    })
}

async fn post_push_subscribe(State(state): State<AppState>) -> Response {
    let sub = push::new_subscription(&state.settings.public_url, OffsetDateTime::now_utc());
    match serde_json::to_string(&sub) {
        Ok(raw) => {
            if let Err(e) = state.kv.set(PUSH_SUBSCRIPTION_KEY, &raw) {
                error!("storing push subscription failed: {e}");
            }
        }
        Err(e) => error!("serializing push subscription failed: {e}"),
    }
    if let Err(e) =
        push::send_to_server(&state.http, state.settings.push_server.as_deref(), &sub).await
    {
        error!("{e}");
    }
    ok(sub)
}

async fn get_static(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    if method != Method::GET {
        return err(StatusCode::NOT_FOUND, "not_found");
    }
    let path = uri.path();
    let navigation = offline_cache::is_navigation(&headers);
    offline_cache::respond(
        &state.cache,
        &state.http,
        &state.settings.origin,
        path,
        navigation,
    )
    .await
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};
    use serde_json::json;
    use todo_core::{store::save_tasks, MemoryBackend, MemoryKv, Permission};

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn task(id: i64, due: Option<&str>, completed: bool) -> Task {
        Task {
            id: TaskId(id),
            text: format!("task {id}"),
            completed,
            created_at: None,
            due_date: due.map(at),
        }
    }

    fn state_with(kv: Arc<dyn KvStore>, backend: MemoryBackend) -> AppState {
        let dispatcher = Arc::new(Dispatcher::new(kv.clone(), Arc::new(backend)));
        let scheduler = ReminderScheduler::new(kv.clone(), dispatcher.clone());
        AppState {
            kv,
            dispatcher,
            scheduler: Arc::new(Mutex::new(scheduler)),
            relay: Arc::new(Mutex::new(RelayHub::default())),
            cache: Arc::new(Mutex::new(OfflineCache::open_in_memory(CACHE_NAME).unwrap())),
            http: reqwest::Client::new(),
            settings: Arc::new(RunnerSettings {
                origin: "http://127.0.0.1:9".to_string(),
                public_url: "http://127.0.0.1:17700".to_string(),
                due_soon_window: Duration::minutes(DUE_SOON_WINDOW_MINUTES),
                push_server: None,
                view_command: None,
            }),
        }
    }

    #[tokio::test]
    async fn check_todos_reminds_due_soon_tasks_once_permitted() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let now = Utc::now();
        let soon = Task::new(TaskId(1), "Call the bank", now)
            .with_due_date(Some(now + Duration::minutes(10)));
        let later = Task::new(TaskId(2), "Dentist", now)
            .with_due_date(Some(now + Duration::hours(2)));
        let mut done = Task::new(TaskId(3), "Post letter", now)
            .with_due_date(Some(now + Duration::minutes(5)));
        done.completed = true;
        let undated = Task::new(TaskId(4), "Someday", now);
        save_tasks(kv.as_ref(), &[soon, later, done, undated]).unwrap();

        let backend = MemoryBackend::new();
        let state = state_with(kv.clone(), backend.clone());

        // Permission not granted yet: nothing is shown.
        assert_eq!(check_todos(&state), 0);
        assert!(backend.shown().is_empty());

        Permission::Granted.store(kv.as_ref()).unwrap();
        let res = post_check_todos(State(state.clone())).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX)
            .await
            .unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v, json!({"ok": true, "data": {"fired": 1}}));

        let shown = backend.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, REMINDER_TITLE);
        assert_eq!(shown[0].body, "Coming up soon: Call the bank");
        assert_eq!(shown[0].data.id, Some(TaskId(1)));
    }

    #[test]
    fn minute_flags_are_bounded() {
        assert!(Args::try_parse_from(["background_runner"]).is_ok());
        assert!(Args::try_parse_from(["background_runner", "--lead-window-minutes", "90"]).is_ok());
        for flag in [
            "--wake-minutes",
            "--lead-window-minutes",
            "--reminder-lead-minutes",
        ] {
            assert!(Args::try_parse_from(["background_runner", flag, "0"]).is_err());
            assert!(Args::try_parse_from(["background_runner", flag, "99999999999999"]).is_err());
        }
    }

    #[test]
    fn parse_listen_accepts_common_forms() {
        assert_eq!(
            parse_listen("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(parse_listen("127.0.0.1").unwrap().port(), DEFAULT_PORT);
        assert_eq!(parse_listen("localhost:18000").unwrap().port(), 18000);
        assert_eq!(parse_listen("localhost").unwrap().port(), DEFAULT_PORT);
        assert!(parse_listen("localhost:http").is_err());
        assert!(parse_listen("example.com").is_err());
    }

    #[test]
    fn due_soon_picks_incomplete_tasks_inside_window() {
        let now = at("2026-02-15T10:00:00Z");
        let tasks = vec![
            task(1, Some("2026-02-15T10:20:00Z"), false),
            task(2, Some("2026-02-15T10:20:00Z"), true),
            task(3, Some("2026-02-15T11:00:00Z"), false),
            task(4, Some("2026-02-15T09:50:00Z"), false),
            task(5, None, false),
            task(6, Some("2026-02-15T10:29:00Z"), false),
        ];
        let ids: Vec<i64> = due_soon_tasks(&tasks, now, Duration::minutes(DUE_SOON_WINDOW_MINUTES))
            .iter()
            .map(|t| t.id.0)
            .collect();
        assert_eq!(ids, vec![1, 6]);
    }
}
