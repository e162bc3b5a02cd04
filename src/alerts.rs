use async_trait::async_trait;
use chrono::Utc;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde_json::json;
use tracing::{debug, error, info, instrument};

use crate::config::{Config, ConfigError, MailConfig, SmtpMode, WebhookConfig};
use crate::storage::PendingAlert;

/// Delivery of pending alerts to administrators
///
/// Implementations report delivery problems through logging only; a batch
/// handed to `dispatch_server_alerts` is considered handled.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn dispatch_server_alerts(&self, alerts: &[PendingAlert]);
}

#[derive(Clone)]
struct MailChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl MailChannel {
    fn from_config(mail: &MailConfig) -> Result<Self, ConfigError> {
        let invalid = |what: &str, err: &dyn std::fmt::Display| {
            ConfigError::Invalid(format!("mail.{what}: {err}"))
        };

        let builder = match mail.smtp_mode {
            SmtpMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&mail.smtp_host)
                .map_err(|e| invalid("smtp_host", &e))?,
            SmtpMode::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&mail.smtp_host)
                    .map_err(|e| invalid("smtp_host", &e))?
            }
            SmtpMode::Plain => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&mail.smtp_host)
            }
        };

        let builder = match mail.smtp_port {
            Some(port) => builder.port(port),
            None => builder,
        };

        let builder = match (&mail.smtp_username, &mail.smtp_password) {
            (Some(username), Some(password)) => {
                builder.credentials(Credentials::new(username.clone(), password.clone()))
            }
            _ => builder,
        };

        let from = mail
            .smtp_from
            .parse::<Mailbox>()
            .map_err(|e| invalid("smtp_from", &e))?;

        let to = mail
            .smtp_to
            .iter()
            .map(|address| address.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid("smtp_to", &e))?;

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        let message = builder
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        self.transport.send(message).await?;
        Ok(())
    }
}

/// Sends alert batches by mail and/or webhook
#[derive(Clone)]
pub struct AlertManager {
    client: Client,
    mail: Option<MailChannel>,
    webhook: Option<WebhookConfig>,
}

impl AlertManager {
    /// Build the channels configured in `config`
    ///
    /// A disabled `[mail]` section is ignored. Invalid addresses or SMTP
    /// hosts are configuration errors.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mail = match &config.mail {
            Some(mail) if mail.enabled => Some(MailChannel::from_config(mail)?),
            _ => None,
        };

        Ok(Self {
            client: Client::new(),
            mail,
            webhook: config.webhook.clone(),
        })
    }

    pub fn has_channels(&self) -> bool {
        self.mail.is_some() || self.webhook.is_some()
    }

    fn subject(alerts: &[PendingAlert]) -> String {
        match alerts.len() {
            1 => format!("[gullveig] {}", alerts[0].summary()),
            n => format!("[gullveig] {n} status changes"),
        }
    }

    fn body(alerts: &[PendingAlert]) -> String {
        let mut body = String::from("The following status changes were detected:\n\n");
        for alert in alerts {
            body.push_str(&alert.summary());
            body.push('\n');
        }
        body
    }

    #[instrument(skip_all)]
    async fn send_mail(&self, mail: &MailChannel, alerts: &[PendingAlert]) {
        match mail.send(&Self::subject(alerts), &Self::body(alerts)).await {
            Ok(()) => info!("Successfully sent alert mail"),
            Err(e) => error!("Failed to send alert mail: {e:#}"),
        }
    }

    #[instrument(skip_all)]
    async fn send_webhook(&self, webhook: &WebhookConfig, alerts: &[PendingAlert]) {
        let payload = json!({
            "message": Self::body(alerts),
            "alerts": alerts,
            "timestamp": Utc::now().to_rfc3339()
        });

        match self.client.post(&webhook.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent webhook alert");
                } else {
                    error!("Webhook alert failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send webhook alert: {}", e);
            }
        }
    }
}

/// Manager without delivery channels; alerts are only logged
impl Default for AlertManager {
    fn default() -> Self {
        Self {
            client: Client::new(),
            mail: None,
            webhook: None,
        }
    }
}

#[async_trait]
impl AlertDispatcher for AlertManager {
    #[instrument(skip_all, fields(count = alerts.len()))]
    async fn dispatch_server_alerts(&self, alerts: &[PendingAlert]) {
        if alerts.is_empty() {
            return;
        }

        if !self.has_channels() {
            for alert in alerts {
                info!("alert (no delivery channel configured): {}", alert.summary());
            }
            return;
        }

        if let Some(mail) = &self.mail {
            self.send_mail(mail, alerts).await;
        }

        if let Some(webhook) = &self.webhook {
            self.send_webhook(webhook, alerts).await;
        }

        debug!("dispatched {} alerts", alerts.len());
    }
}
