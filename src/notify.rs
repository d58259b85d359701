use serde::Serialize;
use std::error::Error;
use tracing::{error, warn};

/// Operator notification channel. Fire-and-forget: implementations must not
/// block the caller and must swallow their own delivery failures.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, message: &str);

    fn notify_error(&self, error: &(dyn Error + Send + Sync));
}

/// Sends notifications to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        warn!(target: "operator", "{}", message);
    }

    fn notify_error(&self, err: &(dyn Error + Send + Sync)) {
        error!(target: "operator", "{}", err);
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    level: &'a str,
    content: String,
}

/// Posts notifications as JSON to a webhook (Discord/Slack style).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    source: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            source: source.into(),
        }
    }

    fn post(&self, level: &'static str, text: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to deliver notification: {}", text);
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        let payload = WebhookPayload {
            level,
            content: format!("[{}] {}", self.source, text),
        };
        let body = match serde_json::to_value(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode notification: {}", e);
                return;
            }
        };

        runtime.spawn(async move {
            let result = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            if let Err(e) = result {
                warn!("Failed to deliver operator notification: {}", e);
            }
        });
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, message: &str) {
        warn!(target: "operator", "{}", message);
        self.post("info", message.to_string());
    }

    fn notify_error(&self, err: &(dyn Error + Send + Sync)) {
        error!(target: "operator", "{}", err);
        self.post("error", err.to_string());
    }
}
