//! Terminal-failure notification over SMTP.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use renderq_core::config::{NotifyConfig, SmtpConfig};

use crate::task::Task;

/// Sink for terminal-failure notifications. Implementations must never
/// surface their own errors as task errors.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn task_failed(&self, task: &Task);
}

/// Used when SMTP is not configured; failures still land in the log.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn task_failed(&self, task: &Task) {
        tracing::warn!(
            task_id = %task.task_id,
            message = %task.status_message,
            "terminal task failure (email notifications not configured)"
        );
    }
}

/// Sends the failure email through a STARTTLS SMTP relay.
pub struct EmailNotifier {
    smtp: SmtpConfig,
    notify: NotifyConfig,
}

impl EmailNotifier {
    pub fn new(smtp: SmtpConfig, notify: NotifyConfig) -> Self {
        Self { smtp, notify }
    }

    async fn send(&self, task: &Task) -> anyhow::Result<()> {
        let from = mailbox(&self.smtp.from_name, &self.smtp.from)?;
        let to = mailbox(&self.notify.to_name, &self.notify.to_email)?;

        let subject = format!("task {} failed", task.task_id);
        let body = format!(
            "Your {} task failed after {} attempt(s): {}\n",
            task.task_type, task.execution_count, task.status_message
        );
        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)?;

        // Each notification owns its SMTP session: connect, authenticate,
        // send, quit. No connection state survives between sends.
        let credentials = Credentials::new(self.smtp.user.clone(), self.smtp.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp.host)?
            .port(self.smtp.port)
            .credentials(credentials)
            .build();
        mailer.send(email).await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn task_failed(&self, task: &Task) {
        match self.send(task).await {
            Ok(()) => {
                tracing::info!(task_id = %task.task_id, to = %self.notify.to_email, "failure notification sent");
            }
            Err(err) => {
                tracing::error!(
                    task_id = %task.task_id,
                    error = %format!("{err:#}"),
                    "failed to send notification email"
                );
            }
        }
    }
}

fn mailbox(name: &str, email: &str) -> anyhow::Result<Mailbox> {
    let raw = if name.is_empty() {
        email.to_string()
    } else {
        format!("{name} <{email}>")
    };
    raw.parse::<Mailbox>()
        .map_err(|err| anyhow::anyhow!("invalid mailbox {raw:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_accepts_bare_and_named_addresses() {
        assert!(mailbox("", "ops@example.com").is_ok());
        let named = mailbox("Render Ops", "ops@example.com").unwrap();
        assert_eq!(named.email.to_string(), "ops@example.com");
        assert!(mailbox("", "not-an-address").is_err());
    }
}
