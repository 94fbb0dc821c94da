use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use tracing::info;

use crate::actions::handlers::ActionHandler;
use crate::actions::{Action, ActionKind, ActionResult};
use crate::error::{EngineError, EngineResult};

/// Every transport gets a bounded timeout.
pub const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_SUBJECT: &str = "Driftwatch notification";

/// Dispatches notifications over webhook, slack, or email transports.
///
/// The `type` parameter selects the transport (webhook is the default);
/// success means the transport accepted the message (2xx for HTTP, no SMTP
/// error for email).
pub struct NotifyHandler {
    http: reqwest::Client,
}

impl NotifyHandler {
    pub fn new() -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(TRANSPORT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Internal(format!("building notify client: {e}")))?;
        Ok(Self { http })
    }

    async fn send_webhook(&self, action: &Action, subject: &str, message: &str) -> EngineResult<ActionResult> {
        let url = action.require_param("webhook_url")?;
        let body = json!({
            "subject": subject,
            "message": message,
            "target": action.target,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Handler(format!("webhook delivery failed: {e}")))?;
        if response.status().is_success() {
            Ok(ActionResult::succeeded("webhook delivered"))
        } else {
            Ok(ActionResult::failed(
                format!("webhook returned {}", response.status()),
                None,
            ))
        }
    }

    async fn send_slack(&self, action: &Action, subject: &str, message: &str) -> EngineResult<ActionResult> {
        let url = action.require_param("webhook_url")?;
        let body = json!({ "text": format!("*{subject}*\n{message}") });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Handler(format!("slack delivery failed: {e}")))?;
        if response.status().is_success() {
            Ok(ActionResult::succeeded("slack message delivered"))
        } else {
            Ok(ActionResult::failed(
                format!("slack returned {}", response.status()),
                None,
            ))
        }
    }

    async fn send_email(&self, action: &Action, subject: &str, message: &str) -> EngineResult<ActionResult> {
        let server = action.require_param("smtp_server")?;
        let port: u16 = action
            .param("smtp_port")
            .unwrap_or("25")
            .parse()
            .map_err(|_| EngineError::InvalidInput("smtp_port must be a port number".to_string()))?;
        let from: Mailbox = action
            .require_param("from")?
            .parse()
            .map_err(|e| EngineError::InvalidInput(format!("bad 'from' address: {e}")))?;
        let to: Mailbox = action
            .require_param("to")?
            .parse()
            .map_err(|e| EngineError::InvalidInput(format!("bad 'to' address: {e}")))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .body(message.to_string())
            .map_err(|e| EngineError::InvalidInput(format!("building email: {e}")))?;

        let mailer: AsyncSmtpTransport<Tokio1Executor> =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(server)
                .port(port)
                .timeout(Some(TRANSPORT_TIMEOUT))
                .build();

        match mailer.send(email).await {
            Ok(_) => Ok(ActionResult::succeeded("email accepted by smtp server")),
            Err(e) => Ok(ActionResult::failed(
                "smtp delivery failed",
                Some(e.to_string()),
            )),
        }
    }
}

#[async_trait]
impl ActionHandler for NotifyHandler {
    fn name(&self) -> &str {
        "notify"
    }

    fn can_handle(&self, kind: ActionKind) -> bool {
        matches!(kind, ActionKind::Notify)
    }

    async fn execute(&self, action: &Action) -> EngineResult<ActionResult> {
        let transport = action.param("type").unwrap_or("webhook");
        let subject = action.param("subject").unwrap_or(DEFAULT_SUBJECT);
        let message = action
            .param("message")
            .map(str::to_string)
            .unwrap_or_else(|| format!("notification for target '{}'", action.target));

        info!(target = %action.target, transport, "sending notification");
        match transport {
            "webhook" => self.send_webhook(action, subject, &message).await,
            "slack" => self.send_slack(action, subject, &message).await,
            "email" => self.send_email(action, subject, &message).await,
            other => Err(EngineError::InvalidInput(format!(
                "unknown notification type '{other}' (expected slack, email, or webhook)"
            ))),
        }
    }
}
