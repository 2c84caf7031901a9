//! Violation notifications.
//!
//! `NotificationManager` fans a message out to every enabled channel
//! (Telegram, Pushover, generic webhook). Requests are first described as
//! `OutboundRequest` values and then sent with `ureq`; delivery failures are
//! logged per channel and never returned to the caller.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::Duration;

use crate::config::NotificationSettings;

const TELEGRAM_API: &str = "https://api.telegram.org";
const PUSHOVER_API: &str = "https://api.pushover.net/1/messages.json";
const TEXT_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

pub trait Notifier: Send {
    fn notify(&self, message: &str, image_path: Option<&Path>);
}

/// Message for a measurement, or `None` when it does not exceed an active limit.
pub fn violation_message(speed_kmh: f64, speed_limit_kmh: f64) -> Option<String> {
    if speed_limit_kmh > 0.0 && speed_kmh > speed_limit_kmh {
        Some(format!(
            "Speed Violation! {:.2} km/h (Limit: {} km/h)",
            speed_kmh, speed_limit_kmh
        ))
    } else {
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Form(Vec<(String, String)>),
    Multipart {
        fields: Vec<(String, String)>,
        file: Attachment,
    },
    Json(serde_json::Value),
    Query(Vec<(String, String)>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboundRequest {
    pub channel: &'static str,
    pub url: String,
    pub body: RequestBody,
    pub timeout: Duration,
}

pub struct NotificationManager {
    settings: NotificationSettings,
}

impl NotificationManager {
    pub fn new(settings: NotificationSettings) -> Self {
        Self { settings }
    }

    pub fn update_settings(&mut self, settings: NotificationSettings) {
        self.settings = settings;
    }

    /// Requests for every enabled, fully configured channel.
    pub fn requests(&self, message: &str, image_path: Option<&Path>) -> Vec<OutboundRequest> {
        let settings = &self.settings;
        if !settings.enabled {
            return Vec::new();
        }
        let image = image_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                log::error!("cannot attach {}: {}", path.display(), err);
                None
            }
        });

        let mut requests = Vec::new();

        let telegram = &settings.telegram;
        if telegram.enabled && !telegram.bot_token.is_empty() && !telegram.chat_id.is_empty() {
            requests.push(OutboundRequest {
                channel: "telegram",
                url: format!("{}/bot{}/sendMessage", TELEGRAM_API, telegram.bot_token),
                body: RequestBody::Form(vec![
                    ("chat_id".into(), telegram.chat_id.clone()),
                    ("text".into(), message.to_string()),
                ]),
                timeout: TEXT_TIMEOUT,
            });
            if let Some(bytes) = &image {
                requests.push(OutboundRequest {
                    channel: "telegram",
                    url: format!("{}/bot{}/sendPhoto", TELEGRAM_API, telegram.bot_token),
                    body: RequestBody::Multipart {
                        fields: vec![("chat_id".into(), telegram.chat_id.clone())],
                        file: Attachment {
                            field: "photo".into(),
                            file_name: "image.jpg".into(),
                            content_type: "image/jpeg".into(),
                            bytes: bytes.clone(),
                        },
                    },
                    timeout: UPLOAD_TIMEOUT,
                });
            }
        }

        let pushover = &settings.pushover;
        if pushover.enabled && !pushover.user_key.is_empty() && !pushover.api_token.is_empty() {
            let fields = vec![
                ("token".to_string(), pushover.api_token.clone()),
                ("user".to_string(), pushover.user_key.clone()),
                ("message".to_string(), message.to_string()),
            ];
            let body = match &image {
                Some(bytes) => RequestBody::Multipart {
                    fields,
                    file: Attachment {
                        field: "attachment".into(),
                        file_name: "image.jpg".into(),
                        content_type: "image/jpeg".into(),
                        bytes: bytes.clone(),
                    },
                },
                None => RequestBody::Form(fields),
            };
            requests.push(OutboundRequest {
                channel: "pushover",
                url: PUSHOVER_API.to_string(),
                body,
                timeout: UPLOAD_TIMEOUT,
            });
        }

        let webhook = &settings.webhook;
        if webhook.enabled && !webhook.url.is_empty() {
            let has_image = image_path.is_some();
            let body = if webhook.method.eq_ignore_ascii_case("POST") {
                RequestBody::Json(serde_json::json!({
                    "message": message,
                    "has_image": has_image,
                }))
            } else {
                RequestBody::Query(vec![
                    ("message".into(), message.to_string()),
                    ("has_image".into(), if has_image { "True" } else { "False" }.into()),
                ])
            };
            requests.push(OutboundRequest {
                channel: "webhook",
                url: webhook.url.clone(),
                body,
                timeout: TEXT_TIMEOUT,
            });
        }

        requests
    }
}

impl Notifier for NotificationManager {
    fn notify(&self, message: &str, image_path: Option<&Path>) {
        for request in self.requests(message, image_path) {
            match send(&request) {
                Ok(()) => log::info!("{} notification sent", request.channel),
                Err(err) => log::error!("{} error: {:#}", request.channel, err),
            }
        }
    }
}

fn send(request: &OutboundRequest) -> Result<()> {
    let result = match &request.body {
        RequestBody::Form(fields) => {
            let pairs: Vec<(&str, &str)> = fields
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            ureq::post(&request.url)
                .timeout(request.timeout)
                .send_form(&pairs)
        }
        RequestBody::Multipart { fields, file } => {
            let boundary = multipart_boundary();
            let body = encode_multipart(&boundary, fields, file);
            ureq::post(&request.url)
                .timeout(request.timeout)
                .set(
                    "Content-Type",
                    &format!("multipart/form-data; boundary={}", boundary),
                )
                .send_bytes(&body)
        }
        RequestBody::Json(value) => ureq::post(&request.url)
            .timeout(request.timeout)
            .set("Content-Type", "application/json")
            .send_string(&serde_json::to_string(value)?),
        RequestBody::Query(params) => params
            .iter()
            .fold(
                ureq::get(&request.url).timeout(request.timeout),
                |req, (k, v)| req.query(k, v),
            )
            .call(),
    };
    result
        .map(|_| ())
        .map_err(|err| anyhow!("{}", err))
        .with_context(|| format!("deliver to {}", request.channel))
}

fn multipart_boundary() -> String {
    format!("speedcam-{:016x}", rand::random::<u64>())
}

pub fn encode_multipart(
    boundary: &str,
    fields: &[(String, String)],
    file: &Attachment,
) -> Vec<u8> {
    let mut body = Vec::with_capacity(file.bytes.len() + 512);
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                boundary, name, value
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
             Content-Type: {}\r\n\r\n",
            boundary, file.field, file.file_name, file.content_type
        )
        .as_bytes(),
    );
    body.extend_from_slice(&file.bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PushoverSettings, TelegramSettings, WebhookSettings};

    fn all_channels() -> NotificationSettings {
        NotificationSettings {
            enabled: true,
            telegram: TelegramSettings {
                enabled: true,
                bot_token: "TOKEN".into(),
                chat_id: "42".into(),
            },
            pushover: PushoverSettings {
                enabled: true,
                user_key: "user".into(),
                api_token: "app".into(),
            },
            webhook: WebhookSettings {
                enabled: true,
                url: "http://hooks.local/speed".into(),
                method: "GET".into(),
            },
        }
    }

    #[test]
    fn message_only_above_active_limit() {
        assert_eq!(
            violation_message(72.456, 50.0).as_deref(),
            Some("Speed Violation! 72.46 km/h (Limit: 50 km/h)")
        );
        assert_eq!(violation_message(50.0, 50.0), None);
        assert_eq!(violation_message(120.0, 0.0), None);
    }

    #[test]
    fn disabled_manager_builds_nothing() {
        let mut settings = all_channels();
        settings.enabled = false;
        let manager = NotificationManager::new(settings);
        assert!(manager.requests("hi", None).is_empty());
    }

    #[test]
    fn text_only_requests_per_channel() {
        let manager = NotificationManager::new(all_channels());
        let requests = manager.requests("hi", None);
        let channels: Vec<_> = requests.iter().map(|r| r.channel).collect();
        assert_eq!(channels, vec!["telegram", "pushover", "webhook"]);
        assert_eq!(
            requests[0].url,
            "https://api.telegram.org/botTOKEN/sendMessage"
        );
        assert!(matches!(requests[1].body, RequestBody::Form(_)));
        assert!(matches!(requests[2].body, RequestBody::Query(_)));
    }

    #[test]
    fn image_adds_telegram_photo_and_pushover_attachment() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("shot.jpg");
        std::fs::write(&image, b"jpeg")?;

        let mut settings = all_channels();
        settings.webhook.method = "POST".into();
        let manager = NotificationManager::new(settings);
        let requests = manager.requests("hi", Some(&image));
        assert_eq!(requests.len(), 4);
        assert!(requests[1].url.ends_with("/sendPhoto"));
        match &requests[2].body {
            RequestBody::Multipart { file, .. } => {
                assert_eq!(file.field, "attachment");
                assert_eq!(file.bytes, b"jpeg");
            }
            other => panic!("unexpected body {:?}", other),
        }
        assert_eq!(
            requests[3].body,
            RequestBody::Json(serde_json::json!({"message": "hi", "has_image": true}))
        );
        Ok(())
    }

    #[test]
    fn incomplete_credentials_skip_channel() {
        let mut settings = all_channels();
        settings.telegram.chat_id.clear();
        settings.pushover.api_token.clear();
        let manager = NotificationManager::new(settings);
        let channels: Vec<_> = manager
            .requests("hi", None)
            .iter()
            .map(|r| r.channel)
            .collect();
        assert_eq!(channels, vec!["webhook"]);
    }

    #[test]
    fn multipart_body_frames_fields_and_file() {
        let file = Attachment {
            field: "photo".into(),
            file_name: "image.jpg".into(),
            content_type: "image/jpeg".into(),
            bytes: b"JPEG".to_vec(),
        };
        let body = encode_multipart("B", &[("chat_id".into(), "42".into())], &file);
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--B\r\nContent-Disposition: form-data; name=\"chat_id\""));
        assert!(text.contains("filename=\"image.jpg\"\r\nContent-Type: image/jpeg\r\n\r\nJPEG"));
        assert!(text.ends_with("\r\n--B--\r\n"));
    }
}
