//! Outbound email. The active provider lives in the `email_provider`
//! singleton row and is selected per send: Postmark speaks HTTP through
//! `reqwest`, SES goes through the AWS SDK with the stored static
//! credentials.

use anyhow::Context;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde::Serialize;
use sqlx::MySql;
use sqlx::Row;
use sqlx::Transaction;

use crate::configuration::EmailDeliverySettings;
use crate::domain::EmailAddress;

/// Tagged provider credentials, as stored in the singleton row and as
/// accepted by `POST /api/email/config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ProviderConfig {
    #[serde(rename_all = "camelCase")]
    Postmark { api_key: String },
    #[serde(rename_all = "camelCase")]
    Ses {
        access_key_id: String,
        secret_access_key: String,
        region: String,
    },
}

/// Replace the singleton provider row. `TRUNCATE` would implicitly commit
/// under MySQL, so this is a delete-then-insert inside the caller's
/// transaction.
pub async fn set_provider(
    tx: &mut Transaction<'static, MySql>,
    config: &ProviderConfig,
    from_address: &EmailAddress,
) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM email_provider")
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO email_provider (id, config, from_address) VALUES (1, ?, ?)")
        .bind(serde_json::to_value(config)?)
        .bind(from_address.as_ref())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn clear_provider(
    tx: &mut Transaction<'static, MySql>
) -> Result<(), anyhow::Error> {
    sqlx::query("DELETE FROM email_provider")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn current_provider(
    tx: &mut Transaction<'static, MySql>
) -> Result<Option<(ProviderConfig, String)>, anyhow::Error> {
    let Some(row) = sqlx::query("SELECT config, from_address FROM email_provider WHERE id = 1")
        .fetch_optional(&mut **tx)
        .await?
    else {
        return Ok(None);
    };
    let config: serde_json::Value = row.get("config");
    let config: ProviderConfig =
        serde_json::from_value(config).context("Stored email provider config is malformed")?;
    Ok(Some((config, row.get("from_address"))))
}

pub struct EmailClient {
    provider: Provider,
    from_address: String,
}

enum Provider {
    Postmark {
        http_client: reqwest::Client,
        base_url: String,
        server_token: Secret<String>,
    },
    Ses {
        access_key_id: String,
        secret_access_key: Secret<String>,
        region: String,
    },
}

/// Postmark's send body; field names are part of their API.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PostmarkEmailRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html_body: &'a str,
}

impl EmailClient {
    /// Build a sender from the configured singleton, or `None` when no
    /// provider has been set up yet.
    pub async fn load(
        tx: &mut Transaction<'static, MySql>,
        settings: &EmailDeliverySettings,
    ) -> Result<Option<Self>, anyhow::Error> {
        let Some((config, from_address)) = current_provider(tx).await? else {
            return Ok(None);
        };
        Ok(Some(Self::new(config, from_address, settings)?))
    }

    pub fn new(
        config: ProviderConfig,
        from_address: String,
        settings: &EmailDeliverySettings,
    ) -> Result<Self, anyhow::Error> {
        let provider = match config {
            ProviderConfig::Postmark { api_key } => Provider::Postmark {
                http_client: reqwest::Client::builder()
                    .timeout(settings.timeout())
                    .build()
                    .context("Could not build the Postmark HTTP client")?,
                base_url: settings.postmark_base_url.clone(),
                server_token: Secret::new(api_key),
            },
            ProviderConfig::Ses {
                access_key_id,
                secret_access_key,
                region,
            } => Provider::Ses {
                access_key_id,
                secret_access_key: Secret::new(secret_access_key),
                region,
            },
        };
        Ok(Self {
            provider,
            from_address,
        })
    }

    #[tracing::instrument(skip(self, html))]
    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
    ) -> Result<(), anyhow::Error> {
        match &self.provider {
            Provider::Postmark {
                http_client,
                base_url,
                server_token,
            } => {
                let body = PostmarkEmailRequest {
                    from: &self.from_address,
                    to,
                    subject,
                    html_body: html,
                };
                http_client
                    .post(format!("{base_url}/email"))
                    .header("X-Postmark-Server-Token", server_token.expose_secret())
                    .json(&body)
                    .send()
                    .await
                    .context("Could not reach Postmark")?
                    .error_for_status()
                    .context("Postmark rejected the send")?;
            }
            Provider::Ses {
                access_key_id,
                secret_access_key,
                region,
            } => {
                send_via_ses(
                    access_key_id,
                    secret_access_key.expose_secret(),
                    region,
                    &self.from_address,
                    to,
                    subject,
                    html,
                )
                .await?;
            }
        }
        Ok(())
    }
}

async fn send_via_ses(
    access_key_id: &str,
    secret_access_key: &str,
    region: &str,
    from: &str,
    to: &str,
    subject: &str,
    html: &str,
) -> Result<(), anyhow::Error> {
    use aws_sdk_sesv2::config::BehaviorVersion;
    use aws_sdk_sesv2::config::Credentials;
    use aws_sdk_sesv2::config::Region;
    use aws_sdk_sesv2::types::Body;
    use aws_sdk_sesv2::types::Content;
    use aws_sdk_sesv2::types::Destination;
    use aws_sdk_sesv2::types::EmailContent;
    use aws_sdk_sesv2::types::Message;

    let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "segflow");
    let config = aws_sdk_sesv2::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .credentials_provider(credentials)
        .build();
    let client = aws_sdk_sesv2::Client::from_conf(config);

    let message = Message::builder()
        .subject(
            Content::builder()
                .data(subject)
                .build()
                .context("Invalid SES subject")?,
        )
        .body(
            Body::builder()
                .html(
                    Content::builder()
                        .data(html)
                        .build()
                        .context("Invalid SES body")?,
                )
                .build(),
        )
        .build();
    client
        .send_email()
        .from_email_address(from)
        .destination(Destination::builder().to_addresses(to).build())
        .content(EmailContent::builder().simple(message).build())
        .send()
        .await
        .context("SES rejected the send")?;
    Ok(())
}
