use async_trait::async_trait;
use serde::Serialize;

use crate::env::BrevoConfig;
use crate::notify::Notifier;

const BREVO_SEND_URL: &str = "https://api.brevo.com/v3/smtp/email";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BrevoEmailAddress {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BrevoSendEmailBody {
    sender: BrevoEmailAddress,
    to: Vec<BrevoEmailAddress>,
    subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_content: Option<String>,
}

fn is_success_status(status: u16) -> bool {
    (200..=299).contains(&status)
}

/// Sends plain-text mail through Brevo's transactional API.
pub struct BrevoNotifier {
    config: BrevoConfig,
    client: reqwest::Client,
}

impl BrevoNotifier {
    pub fn new(config: BrevoConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for BrevoNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), String> {
        let payload = BrevoSendEmailBody {
            sender: BrevoEmailAddress {
                email: self.config.sender_email.clone(),
                name: self.config.sender_name.clone(),
            },
            to: vec![BrevoEmailAddress {
                email: recipient.to_string(),
                name: None,
            }],
            subject: subject.to_string(),
            text_content: Some(body.to_string()),
        };

        let resp = self
            .client
            .post(BREVO_SEND_URL)
            .header("api-key", &self.config.api_key)
            .header("Accept", "application/json")
            .header("User-Agent", concat!("webrpl/", env!("CARGO_PKG_VERSION")))
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("Brevo request failed: {e}"))?;

        let status = resp.status().as_u16();
        if is_success_status(status) {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(format!("Brevo send failed (status={status}): {body}"))
    }
}
