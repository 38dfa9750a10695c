//! Telegram notifier — Bot API over reqwest, HTML parse mode.
//!
//! Shape selection: no images → `sendMessage`; one image → `sendPhoto`
//! with caption; several → `sendMediaGroup` with the caption on the
//! first item, capped at five photos. Any image-path failure falls back
//! once to a text-only `sendMessage` before reporting failure.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use tracing::{error, info, warn};

use crate::error::NotifyError;
use crate::mail::{EmailContent, ImageAttachment};
use crate::notify::{DeliveryOutcome, Notifier};

/// Telegram media groups accept up to 10 photos; we stay well under.
pub const MAX_ALBUM_PHOTOS: usize = 5;

/// Space reserved for the header lines when truncating the body.
const HEADER_RESERVE: usize = 500;

const TRUNCATION_MARKER: &str = "\n\n... (message truncated)";

const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

/// Telegram Bot API notifier.
pub struct TelegramNotifier {
    bot_token: SecretString,
    chat_id: String,
    max_message_length: usize,
    base_url: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString, chat_id: String, max_message_length: usize) -> Self {
        Self {
            bot_token,
            chat_id,
            max_message_length,
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point at a different API host (a local bot-api server, or a test
    /// stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.base_url,
            self.bot_token.expose_secret()
        )
    }

    /// Send a text-only notification.
    async fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        check_response("sendMessage", resp).await
    }

    /// Send a single photo with the formatted text as its caption.
    async fn send_photo(&self, image: &ImageAttachment, caption: &str) -> Result<(), NotifyError> {
        let part = Part::bytes(image.data.clone()).file_name(image.filename.clone());
        let form = Form::new()
            .text("chat_id", self.chat_id.clone())
            .text("caption", caption.to_string())
            .text("parse_mode", "HTML")
            .part("photo", part);

        let resp = self
            .client
            .post(self.api_url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        check_response("sendPhoto", resp).await
    }

    /// Send a grouped album; only the first item carries the caption.
    async fn send_album(
        &self,
        images: &[ImageAttachment],
        caption: &str,
    ) -> Result<(), NotifyError> {
        let mut form = Form::new().text("chat_id", self.chat_id.clone());
        let mut media = Vec::with_capacity(images.len());

        for (i, image) in images.iter().enumerate() {
            let field = format!("file{i}");
            form = form.part(
                field.clone(),
                Part::bytes(image.data.clone()).file_name(image.filename.clone()),
            );

            let mut item = serde_json::json!({
                "type": "photo",
                "media": format!("attach://{field}"),
            });
            if i == 0 {
                item["caption"] = serde_json::Value::String(caption.to_string());
                item["parse_mode"] = serde_json::Value::String("HTML".into());
            }
            media.push(item);
        }
        form = form.text("media", serde_json::Value::Array(media).to_string());

        let resp = self
            .client
            .post(self.api_url("sendMediaGroup"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| NotifyError::Http(e.to_string()))?;

        check_response("sendMediaGroup", resp).await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, content: &EmailContent) -> DeliveryOutcome {
        let message = format_message(
            &content.subject,
            &content.sender,
            &content.body,
            self.max_message_length,
        );

        if content.images.is_empty() {
            return match self.send_text(&message).await {
                Ok(()) => {
                    info!("Text notification sent");
                    DeliveryOutcome::ok()
                }
                Err(e) => {
                    error!("Failed to send text notification: {e}");
                    DeliveryOutcome::failed(e.to_string())
                }
            };
        }

        let album = &content.images[..content.images.len().min(MAX_ALBUM_PHOTOS)];
        if content.images.len() > album.len() {
            warn!(
                "Only sending {} of {} images due to album limits",
                album.len(),
                content.images.len()
            );
        }

        let image_result = if album.len() == 1 {
            self.send_photo(&album[0], &message).await
        } else {
            self.send_album(album, &message).await
        };

        match image_result {
            Ok(()) => {
                info!("Notification with {} image(s) sent", album.len());
                DeliveryOutcome::ok()
            }
            Err(image_err) => {
                warn!("Image delivery failed, falling back to text-only: {image_err}");
                match self.send_text(&message).await {
                    Ok(()) => {
                        info!("Fallback text notification sent");
                        DeliveryOutcome::ok()
                    }
                    Err(fallback_err) => DeliveryOutcome::failed(format!(
                        "{image_err}. Fallback also failed: {fallback_err}"
                    )),
                }
            }
        }
    }

    async fn test_connection(&self) -> bool {
        match self.client.get(self.api_url("getMe")).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                error!("Telegram connection test failed: getMe returned {}", resp.status());
                false
            }
            Err(e) => {
                error!("Telegram connection test failed: {e}");
                false
            }
        }
    }
}

// ── Formatting ──────────────────────────────────────────────────────

/// Escape characters significant to Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render the notification text: header lines plus the body, truncated
/// to fit and escaped afterwards so escaping never re-expands past the
/// limit.
pub fn format_message(subject: &str, sender: &str, body: &str, max_length: usize) -> String {
    let max_body = max_length.saturating_sub(HEADER_RESERVE);
    let truncated = truncate_body(body, max_body);
    let body_text = if truncated.is_empty() {
        "No content".to_string()
    } else {
        escape_html(&truncated)
    };

    format!(
        "\u{1F4E7} <b>New Email Received</b>\n\n\
         <b>From:</b> {}\n\
         <b>Subject:</b> {}\n\
         <b>Content:</b>\n{body_text}",
        escape_html(sender),
        escape_html(subject),
    )
}

/// Cut the body to `max_chars` including the truncation marker.
fn truncate_body(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let cut: String = body.chars().take(keep).collect();
    format!("{cut}{TRUNCATION_MARKER}")
}

async fn check_response(method: &str, resp: reqwest::Response) -> Result<(), NotifyError> {
    if resp.status().is_success() {
        return Ok(());
    }
    let detail = resp.text().await.unwrap_or_default();
    Err(NotifyError::Api {
        method: method.to_string(),
        detail,
    })
}

// ── Tests ───────────────────────────────────────────────────────────
