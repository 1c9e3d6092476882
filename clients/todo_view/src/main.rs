mod runner_client;

use anyhow::Context;
use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use clap::{Parser, Subcommand};
use runner_client::{RunnerBackend, RunnerClient, TerminalBackend};
use std::{path::PathBuf, sync::Arc};
use todo_core::{
    reminder::DUE_SOON_WINDOW_MINUTES, due_within_window, Filter, KvStore, ListItem, ListView,
    NotificationBackend, RelayMessage, SqliteKv, TaskId, TodoApp,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
    time::{sleep, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "todo_view", version)]
#[command(about = "Terminal to-do list with due-date reminders", long_about = None)]
struct Args {
    /// SQLite database path, shared with background_runner.
    #[arg(long, default_value = "./data/todo.db")]
    db: PathBuf,

    /// Background runner base URL.
    #[arg(long, default_value = "http://127.0.0.1:17700")]
    runner_url: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the list (default)
    List {
        /// all, active or completed
        #[arg(short, long, default_value = "all")]
        filter: Filter,
    },
    /// Add a task
    Add {
        #[arg(required = true)]
        text: Vec<String>,
        /// Due date: RFC 3339, "YYYY-MM-DD HH:MM" (local), "HH:MM" (today) or "+30m"/"+2h"/"+1d"
        #[arg(short, long)]
        due: Option<String>,
    },
    /// Flip a task between active and completed
    Toggle { id: TaskId },
    /// Remove a task
    Delete { id: TaskId },
    /// Remove every completed task
    ClearCompleted,
    /// Notification permission
    Notifications {
        #[command(subcommand)]
        action: NotificationsCommand,
    },
    /// Background-runner install hint
    Install {
        #[command(subcommand)]
        action: InstallCommand,
    },
    /// Push subscription
    Push {
        #[command(subcommand)]
        action: PushCommand,
    },
    /// Stay open: keep reminders armed and receive notification actions
    Watch {
        /// Relay poll interval (milliseconds).
        #[arg(long, default_value_t = 1000)]
        poll_ms: u64,
    },
}

#[derive(Subcommand, Debug)]
enum NotificationsCommand {
    Enable,
    Deny,
    DismissBanner,
    Status,
}

#[derive(Subcommand, Debug)]
enum InstallCommand {
    DismissBanner,
}

#[derive(Subcommand, Debug)]
enum PushCommand {
    Subscribe,
}

/// A user action, from either the command line or the watch prompt.
#[derive(Debug, PartialEq)]
enum Action {
    Add {
        text: String,
        due: Option<DateTime<Utc>>,
    },
    Toggle(TaskId),
    Delete(TaskId),
    ClearCompleted,
    Filter(Filter),
    List,
    Help,
    Quit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "todo_view=warn,todo_core=warn".into()),
        )
        .init();

    let args = Args::parse();
    let kv: Arc<dyn KvStore> = Arc::new(
        SqliteKv::open(&args.db).with_context(|| format!("opening {}", args.db.display()))?,
    );
    let client = RunnerClient::new(&args.runner_url);

    let command = args.command.unwrap_or(Command::List {
        filter: Filter::All,
    });

    let backend: Arc<dyn NotificationBackend> = match command {
        Command::Watch { .. } => Arc::new(RunnerBackend::new(client.clone())),
        _ => Arc::new(TerminalBackend),
    };
    let mut app = TodoApp::new(kv, backend);

    match command {
        Command::List { filter } => {
            apply(&mut app, &client, Action::Filter(filter)).await?;
            print_banners(&app, &client).await;
        }
        Command::Add { text, due } => {
            let due = due
                .as_deref()
                .map(|d| parse_due(d, Local::now()))
                .transpose()?;
            apply(
                &mut app,
                &client,
                Action::Add {
                    text: text.join(" "),
                    due,
                },
            )
            .await?;
        }
        Command::Toggle { id } => {
            apply(&mut app, &client, Action::Toggle(id)).await?;
        }
        Command::Delete { id } => {
            apply(&mut app, &client, Action::Delete(id)).await?;
        }
        Command::ClearCompleted => {
            apply(&mut app, &client, Action::ClearCompleted).await?;
        }
        Command::Notifications { action } => match action {
            NotificationsCommand::Enable => {
                app.grant_notifications()?;
                println!("Notifications enabled.");
            }
            NotificationsCommand::Deny => {
                let advisory = app.deny_notifications()?;
                println!("{advisory}");
            }
            NotificationsCommand::DismissBanner => app.dismiss_notification_banner()?,
            NotificationsCommand::Status => println!("{}", app.permission().as_str()),
        },
        Command::Install { action } => match action {
            InstallCommand::DismissBanner => app.dismiss_install_banner()?,
        },
        Command::Push { action } => match action {
            PushCommand::Subscribe => match client.subscribe_push().await {
                Ok(sub) => println!("{}", serde_json::to_string_pretty(&sub)?),
                Err(e) => {
                    warn!("push subscription failed: {e}");
                    println!("Push subscription failed; is background_runner running?");
                }
            },
        },
        Command::Watch { poll_ms } => watch(&mut app, &client, poll_ms).await?,
    }
    Ok(())
}

/// Runs one action against the app, then re-renders.
async fn apply(app: &mut TodoApp, client: &RunnerClient, action: Action) -> anyhow::Result<bool> {
    match action {
        Action::Add { text, due } => match app.add(&text, due)? {
            Some(task) => {
                println!("Added {} {}", task.id, task.text);
                if task.due_date.is_some() {
                    // The runner keeps the reminder alive after this view exits.
                    if let Err(e) = client.send(&RelayMessage::schedule(task)).await {
                        debug!("runner did not take the schedule request: {e}");
                        if !app.local_reminders() {
                            app.set_local_reminders(true);
                        }
                    }
                }
            }
            None => println!("Nothing to add: task text is empty."),
        },
        Action::Toggle(id) => {
            if !app.toggle(id)? {
                println!("No task with id {id}");
            }
        }
        Action::Delete(id) => {
            if !app.delete(id)? {
                println!("No task with id {id}");
            }
        }
        Action::ClearCompleted => {
            let removed = app.clear_completed()?;
            println!("Removed {removed} completed");
        }
        Action::Filter(filter) => {
            app.set_filter(filter);
        }
        Action::List => {}
        Action::Help => {
            println!("{WATCH_HELP}");
            return Ok(true);
        }
        Action::Quit => return Ok(false),
    }
    print_view(&app.view());
    Ok(true)
}

const WATCH_HELP: &str = "commands: add <text> [--due <when>] | toggle <id> | delete <id> | \
filter <all|active|completed> | clear | list | help | quit";

async fn watch(app: &mut TodoApp, client: &RunnerClient, poll_ms: u64) -> anyhow::Result<()> {
    let view_id = format!("view-{}", std::process::id());
    let armed = app.start();
    info!("{view_id}: {armed} reminder timers armed");

    let window = chrono::Duration::minutes(DUE_SOON_WINDOW_MINUTES);
    let now = Utc::now();
    for task in app.store().tasks().iter().filter(|t| t.is_active()) {
        if matches!(task.due_date, Some(due) if due_within_window(due, now, window)) {
            info!(task_id = %task.id, "due within {DUE_SOON_WINDOW_MINUTES} minutes");
        }
    }
    hand_off_reminders(app, client).await;

    print_view(&app.view());
    print_banners(app, client).await;
    println!("{WATCH_HELP}");

    watch_loop(app, client, &view_id, poll_ms, BufReader::new(tokio::io::stdin())).await
}

/// Sends every pending dated task to the runner. While the runner holds them
/// this view arms no timers of its own; if any send fails it arms them again.
async fn hand_off_reminders(app: &mut TodoApp, client: &RunnerClient) -> bool {
    let now = Utc::now();
    let pending: Vec<_> = app
        .store()
        .tasks()
        .iter()
        .filter(|t| t.is_active() && t.due_date.is_some_and(|due| due > now))
        .cloned()
        .collect();
    for task in pending {
        if let Err(e) = client.send(&RelayMessage::schedule(task)).await {
            debug!("runner did not take the schedule request: {e}");
            let armed = app.set_local_reminders(true);
            info!("reminders stay in this view: {armed} timers armed");
            return false;
        }
    }
    if app.local_reminders() {
        app.set_local_reminders(false);
        info!("reminders handed to the background runner");
    }
    true
}

/// Polls the runner relay and reads commands from `input` until the user
/// quits. Polling continues after `input` reaches EOF, so a view launched
/// without a terminal still receives notification actions.
async fn watch_loop<R>(
    app: &mut TodoApp,
    client: &RunnerClient,
    view_id: &str,
    poll_ms: u64,
    input: R,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let every = Duration::from_millis(poll_ms.max(100));
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut lines = input.lines();
    let mut input_open = true;
    let mut runner_down = app.local_reminders();

    loop {
        tokio::select! {
            biased;

            _ = ticker.tick() => {
                match client.poll(view_id).await {
                    Ok(messages) => {
                        if runner_down {
                            runner_down = !hand_off_reminders(app, client).await;
                        }
                        let mut changed = false;
                        for msg in messages {
                            changed |= app.handle_relay(msg)?;
                        }
                        if changed {
                            print_view(&app.view());
                        }
                    }
                    Err(e) => {
                        if !runner_down {
                            warn!("runner relay unavailable: {e}");
                            runner_down = true;
                            let armed = app.set_local_reminders(true);
                            info!("{armed} reminder timers armed locally");
                        }
                        sleep(every).await;
                    }
                }
            }
            line = lines.next_line(), if input_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("input closed; still polling for notification actions");
                        input_open = false;
                        continue;
                    }
                    Err(e) => {
                        warn!("reading input failed: {e}");
                        input_open = false;
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_action(&line, Local::now()) {
                    Ok(action) => {
                        if !apply(app, client, action).await? {
                            break;
                        }
                    }
                    Err(e) => println!("{e}"),
                }
            }
        }
    }
    Ok(())
}

/// Parses a line typed at the watch prompt.
fn parse_action(line: &str, now: DateTime<Local>) -> anyhow::Result<Action> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let id = |s: &str| -> anyhow::Result<TaskId> {
        s.parse::<TaskId>()
            .map_err(|_| anyhow::anyhow!("expected a task id, got '{s}'"))
    };
    match word.to_ascii_lowercase().as_str() {
        "add" => {
            let (text, due) = match rest.split_once("--due") {
                Some((text, due)) => (text.trim(), Some(parse_due(due.trim(), now)?)),
                None => (rest, None),
            };
            Ok(Action::Add {
                text: text.to_string(),
                due,
            })
        }
        "toggle" => Ok(Action::Toggle(id(rest)?)),
        "delete" | "rm" => Ok(Action::Delete(id(rest)?)),
        "filter" => rest
            .parse::<Filter>()
            .map(Action::Filter)
            .map_err(|e| anyhow::anyhow!(e)),
        "clear" => Ok(Action::ClearCompleted),
        "list" | "ls" => Ok(Action::List),
        "help" | "?" => Ok(Action::Help),
        "quit" | "exit" | "q" => Ok(Action::Quit),
        other => anyhow::bail!("unknown command '{other}'. {WATCH_HELP}"),
    }
}

/// Accepts RFC 3339, local "YYYY-MM-DD HH:MM[:SS]" (space or T), local
/// "HH:MM" for today, or an offset from now like "+45m", "+2h", "+1d".
fn parse_due(input: &str, now: DateTime<Local>) -> anyhow::Result<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(rel) = s.strip_prefix('+') {
        let split = rel.char_indices().last().map_or(0, |(i, _)| i);
        let (num, unit) = rel.split_at(split);
        let n: i64 = num
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid due offset '{s}'. Example: +30m"))?;
        let delta = match unit {
            "m" => TimeDelta::try_minutes(n),
            "h" => TimeDelta::try_hours(n),
            "d" => TimeDelta::try_days(n),
            _ => anyhow::bail!("invalid due offset '{s}': unit must be m, h or d"),
        };
        return delta
            .and_then(|d| now.checked_add_signed(d))
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| anyhow::anyhow!("due offset '{s}' is out of range"));
    }

    for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return local_to_utc(naive, s);
        }
    }

    if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M") {
        return local_to_utc(now.date_naive().and_time(time), s);
    }

    anyhow::bail!("invalid due date '{s}'. Use RFC 3339, 'YYYY-MM-DD HH:MM', 'HH:MM' or '+30m'")
}

fn local_to_utc(naive: NaiveDateTime, input: &str) -> anyhow::Result<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow::anyhow!("'{input}' does not exist in the local time zone"))
}

fn format_item(item: &ListItem) -> String {
    let mark = if item.completed { "[x]" } else { "[ ]" };
    match item.due_date {
        Some(due) => format!(
            "  {mark} {}  {}  (due {})",
            item.id,
            item.text,
            due.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        ),
        None => format!("  {mark} {}  {}", item.id, item.text),
    }
}

fn print_view(view: &ListView) {
    println!("Filter: {}", view.filter);
    match view.empty_message() {
        Some(msg) => println!("  {msg}"),
        None => {
            for item in &view.items {
                println!("{}", format_item(item));
            }
        }
    }
    println!("{}", view.items_left_label());
}

async fn print_banners(app: &TodoApp, client: &RunnerClient) {
    if app.notification_banner_visible() {
        println!(
            "Get reminders for due tasks: `todo_view notifications enable` \
             (or `notifications dismiss-banner`)"
        );
    }
    if app.install_banner_visible() && !client.is_up().await {
        println!(
            "Start `background_runner` so reminders keep working when this view is closed \
             (hide this: `todo_view install dismiss-banner`)"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use todo_core::{load_tasks, store::save_tasks, MemoryKv, Task};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local(s: &str) -> DateTime<Local> {
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    #[test]
    fn parse_due_rfc3339_and_offsets() {
        let now = local("2026-02-15 10:00");
        assert_eq!(
            parse_due("2026-02-15T12:00:00Z", now).unwrap().to_rfc3339(),
            "2026-02-15T12:00:00+00:00"
        );
        assert_eq!(
            parse_due("+45m", now).unwrap(),
            now.with_timezone(&Utc) + chrono::Duration::minutes(45)
        );
        assert_eq!(
            parse_due("+2h", now).unwrap(),
            now.with_timezone(&Utc) + chrono::Duration::hours(2)
        );
        assert!(parse_due("+2w", now).is_err());
        assert!(parse_due("+m", now).is_err());
    }

    #[test]
    fn parse_due_local_forms() {
        let now = local("2026-02-15 10:00");
        let expected = local("2026-02-16 09:30").with_timezone(&Utc);
        assert_eq!(parse_due("2026-02-16 09:30", now).unwrap(), expected);
        assert_eq!(parse_due("2026-02-16T09:30", now).unwrap(), expected);
        assert_eq!(
            parse_due("18:15", now).unwrap(),
            local("2026-02-15 18:15").with_timezone(&Utc)
        );
        assert!(parse_due("tomorrow", now).is_err());
    }

    #[test]
    fn parse_watch_commands() {
        let now = local("2026-02-15 10:00");
        assert_eq!(
            parse_action("add Buy milk --due +1h", now).unwrap(),
            Action::Add {
                text: "Buy milk".to_string(),
                due: Some(now.with_timezone(&Utc) + chrono::Duration::hours(1)),
            }
        );
        assert_eq!(
            parse_action("add   call mom ", now).unwrap(),
            Action::Add {
                text: "call mom".to_string(),
                due: None,
            }
        );
        assert_eq!(parse_action("toggle 42", now).unwrap(), Action::Toggle(TaskId(42)));
        assert_eq!(parse_action("rm 7", now).unwrap(), Action::Delete(TaskId(7)));
        assert_eq!(
            parse_action("filter active", now).unwrap(),
            Action::Filter(Filter::Active)
        );
        assert_eq!(parse_action("clear", now).unwrap(), Action::ClearCompleted);
        assert_eq!(parse_action("q", now).unwrap(), Action::Quit);
        assert!(parse_action("toggle abc", now).is_err());
        assert!(parse_action("filter done", now).is_err());
        assert!(parse_action("frobnicate", now).is_err());
    }

    #[test]
    fn format_item_marks_completion() {
        let item = ListItem {
            id: TaskId(5),
            text: "Read".to_string(),
            completed: true,
            due_date: None,
        };
        assert_eq!(format_item(&item), "  [x] 5  Read");
    }

    #[test]
    fn oversized_offsets_are_rejected() {
        let now = local("2026-02-15 10:00");
        assert!(parse_due("+9999999999999d", now).is_err());
        assert!(parse_due("+300000000d", now).is_err());
        assert!(parse_due(&format!("+{}m", i64::MAX), now).is_err());
        assert!(parse_action("add x --due +300000000d", now).is_err());
    }

    /// Answers every request with the same relay poll body.
    async fn fake_runner(body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = sock.write_all(reply.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn closed_input_keeps_polling_until_action_arrives() {
        let url = fake_runner(
            r#"{"ok":true,"data":[{"type":"NOTIFICATION_ACTION","payload":{"action":"complete","todoId":7}}]}"#,
        )
        .await;
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        save_tasks(kv.as_ref(), &[Task::new(TaskId(7), "Pay rent", Utc::now())]).unwrap();
        let mut app = TodoApp::new(kv.clone(), Arc::new(TerminalBackend));
        let client = RunnerClient::new(&url);

        let input: &[u8] = b"";
        let run = watch_loop(&mut app, &client, "view-test", 100, input);
        // Empty input must not end the loop.
        assert!(tokio::time::timeout(Duration::from_millis(1500), run)
            .await
            .is_err());
        assert!(load_tasks(kv.as_ref())[0].completed);
    }

    #[tokio::test]
    async fn quit_on_input_ends_the_loop() {
        let url = fake_runner(r#"{"ok":true,"data":[]}"#).await;
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let mut app = TodoApp::new(kv, Arc::new(TerminalBackend));
        let client = RunnerClient::new(&url);

        let input: &[u8] = b"list\nquit\n";
        let run = watch_loop(&mut app, &client, "view-test", 100, input);
        assert!(tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .is_ok());
    }
}
