use todo_core::{Notification, NotificationBackend};
use tracing::info;

/// Shows reminders on the desktop. On Windows this is a toast whose buttons
/// call back into `/notifications/click`; elsewhere the notification is logged.
pub struct PlatformBackend {
    click_url: String,
}

impl PlatformBackend {
    pub fn new(public_url: &str) -> Self {
        Self {
            click_url: format!("{}/notifications/click", public_url.trim_end_matches('/')),
        }
    }

    pub fn click_link(&self, action: Option<&str>, id: Option<i64>) -> String {
        let mut params = Vec::new();
        if let Some(action) = action {
            params.push(format!("action={action}"));
        }
        if let Some(id) = id {
            params.push(format!("id={id}"));
        }
        if params.is_empty() {
            self.click_url.clone()
        } else {
            format!("{}?{}", self.click_url, params.join("&"))
        }
    }
}

impl NotificationBackend for PlatformBackend {
    fn show(&self, n: &Notification) -> anyhow::Result<()> {
        info!(task_id = ?n.data.id, "notification: {} | {}", n.title, n.body);

        #[cfg(windows)]
        {
            use win_toast_notify::{Action, ActivationType, Duration, Scenario, WinToastNotify};

            let id = n.data.id.map(|id| id.0);
            let open_link = self.click_link(None, id);
            let actions = n
                .actions
                .iter()
                .map(|a| Action {
                    activation_type: ActivationType::Protocol,
                    action_content: a.title.clone(),
                    arguments: self.click_link(Some(a.action.as_str()), id),
                    image_url: None,
                })
                .collect::<Vec<_>>();
            let _ = WinToastNotify::new()
                .set_open(open_link.as_str())
                .set_duration(Duration::Long)
                .set_scenario(Scenario::Reminder)
                .set_title(n.title.as_str())
                .set_messages(vec![n.body.as_str()])
                .set_actions(actions)
                .show();
        }

        Ok(())
    }
}
