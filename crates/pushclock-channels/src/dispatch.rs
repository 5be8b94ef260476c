//! Delivery: one outbound HTTP call per send, bounded by a timeout.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use pushclock_core::config::DispatchConfig;
use pushclock_core::error::{PushclockError, Result};
use pushclock_core::traits::Notifier;
use pushclock_core::types::ChannelConfig;

use crate::target::{ChannelKind, ChannelTarget, WebhookMethod};
use crate::template;

type HmacSha256 = Hmac<Sha256>;

const PUSHPLUS_URL: &str = "https://www.pushplus.plus/send";
const SERVERCHAN_URL: &str = "https://sctapi.ftqq.com";

/// A fully built request, ready to go on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub method: WebhookMethod,
    pub headers: Vec<(String, String)>,
    pub payload: serde_json::Value,
}

/// Renders templates and sends to one channel per call. No retries.
pub struct ChannelDispatcher {
    client: reqwest::Client,
    timeout: Duration,
    tz: chrono_tz::Tz,
}

impl ChannelDispatcher {
    pub fn new(config: &DispatchConfig, tz: chrono_tz::Tz) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PushclockError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
            tz,
        })
    }

    /// Deliver an already rendered message to a validated target.
    pub async fn deliver(&self, target: &ChannelTarget, title: &str, body: &str) -> Result<()> {
        let kind = target.kind();
        let request = build_request(target, title, body, Utc::now())?;

        let builder = match request.method {
            WebhookMethod::Post => self.client.post(&request.url),
            WebhookMethod::Put => self.client.put(&request.url),
        };
        let mut builder = builder.json(&request.payload).timeout(self.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| PushclockError::Delivery(format!("{kind} send failed: {e}")))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(PushclockError::Delivery(format!("{kind} error {status}: {text}")));
        }

        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
            check_provider_response(kind, &json)?;
        }
        tracing::info!("✅ {kind} notification sent: {title}");
        Ok(())
    }
}

#[async_trait]
impl Notifier for ChannelDispatcher {
    async fn send(&self, channel: &str, config: &ChannelConfig, title: &str, body: &str) -> Result<()> {
        let target = ChannelTarget::parse(channel, config)?;
        let now = Utc::now().with_timezone(&self.tz);
        let title = template::render(title, &now);
        let body = template::render(body, &now);
        self.deliver(&target, &title, &body).await
    }
}

/// Build the provider-specific request for `target`.
pub fn build_request(target: &ChannelTarget, title: &str, body: &str, now: DateTime<Utc>) -> Result<OutboundRequest> {
    let text = if title.is_empty() {
        body.to_string()
    } else {
        format!("{title}\n{body}")
    };
    let json_post = |url: String, payload: serde_json::Value| OutboundRequest {
        url,
        method: WebhookMethod::Post,
        headers: Vec::new(),
        payload,
    };

    let request = match target {
        ChannelTarget::Webhook { url, method, headers } => OutboundRequest {
            url: url.clone(),
            method: *method,
            headers: headers.clone(),
            payload: serde_json::json!({
                "title": title,
                "body": body,
                "timestamp": now.to_rfc3339(),
            }),
        },
        ChannelTarget::WecomWebhook { webhook_url, markdown } => {
            let payload = if *markdown {
                serde_json::json!({
                    "msgtype": "markdown",
                    "markdown": { "content": format!("## {title}\n{body}") }
                })
            } else {
                serde_json::json!({ "msgtype": "text", "text": { "content": text } })
            };
            json_post(webhook_url.clone(), payload)
        }
        ChannelTarget::FeishuWebhook { webhook_url, secret } => {
            let mut payload = serde_json::json!({ "msg_type": "text", "content": { "text": text } });
            if let Some(secret) = secret {
                let timestamp = now.timestamp();
                payload["timestamp"] = timestamp.to_string().into();
                payload["sign"] = feishu_sign(secret, timestamp)?.into();
            }
            json_post(webhook_url.clone(), payload)
        }
        ChannelTarget::DingtalkWebhook { webhook_url, secret } => {
            let url = match secret {
                Some(secret) => dingtalk_signed_url(webhook_url, secret, now.timestamp_millis())?,
                None => webhook_url.clone(),
            };
            json_post(url, serde_json::json!({ "msgtype": "text", "text": { "content": text } }))
        }
        ChannelTarget::PushPlus { token, template, topic } => {
            let mut payload = serde_json::json!({
                "token": token,
                "title": title,
                "content": body,
                "template": template,
            });
            if let Some(topic) = topic {
                payload["topic"] = topic.clone().into();
            }
            json_post(PUSHPLUS_URL.to_string(), payload)
        }
        ChannelTarget::ServerChan { token } => json_post(
            format!("{SERVERCHAN_URL}/{token}.send"),
            serde_json::json!({ "title": title, "desp": body }),
        ),
        ChannelTarget::Bark { server, device_key, sound, group } => {
            let mut payload = serde_json::json!({
                "device_key": device_key,
                "title": title,
                "body": body,
            });
            if let Some(sound) = sound {
                payload["sound"] = sound.clone().into();
            }
            if let Some(group) = group {
                payload["group"] = group.clone().into();
            }
            json_post(format!("{server}/push"), payload)
        }
    };
    Ok(request)
}

/// Providers that answer 200 with an error code in the body.
fn check_provider_response(kind: ChannelKind, json: &serde_json::Value) -> Result<()> {
    let int = |key: &str| json.get(key).and_then(|v| v.as_i64());
    let text = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| json.get(*k).and_then(|v| v.as_str()))
            .unwrap_or("unknown error")
            .to_string()
    };

    let failure = match kind {
        ChannelKind::WecomWebhook | ChannelKind::DingtalkWebhook => int("errcode")
            .filter(|code| *code != 0)
            .map(|code| format!("errcode {code}: {}", text(&["errmsg"]))),
        ChannelKind::FeishuWebhook => int("code")
            .or_else(|| int("StatusCode"))
            .filter(|code| *code != 0)
            .map(|code| format!("code {code}: {}", text(&["msg", "StatusMessage"]))),
        ChannelKind::PushPlus | ChannelKind::Bark => int("code")
            .filter(|code| *code != 200)
            .map(|code| format!("code {code}: {}", text(&["msg", "message"]))),
        ChannelKind::ServerChan => int("code")
            .filter(|code| *code != 0)
            .map(|code| format!("code {code}: {}", text(&["message", "info"]))),
        ChannelKind::Webhook => None,
    };

    match failure {
        Some(detail) => Err(PushclockError::Delivery(format!("{kind} rejected: {detail}"))),
        None => Ok(()),
    }
}

fn hmac_base64(key: &[u8], message: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| PushclockError::Other(format!("HMAC key: {e}")))?;
    mac.update(message);
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Feishu signs with `timestamp\nsecret` as the key over an empty message.
fn feishu_sign(secret: &str, timestamp: i64) -> Result<String> {
    hmac_base64(format!("{timestamp}\n{secret}").as_bytes(), b"")
}

/// DingTalk signs `timestamp\nsecret` with the secret and expects it in the query.
fn dingtalk_signed_url(webhook_url: &str, secret: &str, timestamp_ms: i64) -> Result<String> {
    let sign = hmac_base64(secret.as_bytes(), format!("{timestamp_ms}\n{secret}").as_bytes())?;
    let mut url = reqwest::Url::parse(webhook_url)
        .map_err(|_| PushclockError::missing_field(ChannelKind::DingtalkWebhook.as_str(), "webhook_url"))?;
    url.query_pairs_mut()
        .append_pair("timestamp", &timestamp_ms.to_string())
        .append_pair("sign", &sign);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg(value: serde_json::Value) -> ChannelConfig {
        value.as_object().cloned().unwrap()
    }

    fn dispatcher() -> ChannelDispatcher {
        ChannelDispatcher::new(&DispatchConfig::default(), chrono_tz::UTC).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_success_renders_templates() {
        let server = MockServer::start().await;
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Token", "secret"))
            .and(body_partial_json(json!({ "title": "Daily", "body": format!("Report {today}") })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = cfg(json!({
            "url": format!("{}/hook", server.uri()),
            "headers": { "X-Token": "secret" }
        }));
        dispatcher()
            .send("webhook", &config, "Daily", "Report {{date}}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_2xx_carries_provider_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .expect(1)
            .mount(&server)
            .await;

        let config = cfg(json!({ "url": server.uri() }));
        let err = dispatcher().send("webhook", &config, "t", "b").await.unwrap_err();
        match err {
            PushclockError::Delivery(msg) => {
                assert!(msg.contains("502"), "{msg}");
                assert!(msg.contains("upstream down"), "{msg}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_wecom_errcode_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "msgtype": "text" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "errcode": 93000, "errmsg": "invalid webhook url" })),
            )
            .mount(&server)
            .await;

        let config = cfg(json!({ "webhook_url": server.uri() }));
        let err = dispatcher().send("wecom_webhook", &config, "t", "b").await.unwrap_err();
        assert!(err.to_string().contains("invalid webhook url"));
    }

    #[tokio::test]
    async fn test_bark_custom_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/push"))
            .and(body_partial_json(json!({ "device_key": "dev1", "title": "Hi" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 200, "message": "success" })))
            .expect(1)
            .mount(&server)
            .await;

        let config = cfg(json!({ "device_key": "dev1", "server": format!("{}/", server.uri()) }));
        dispatcher().send("bark", &config, "Hi", "there").await.unwrap();
    }

    #[tokio::test]
    async fn test_exactly_one_call_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let config = cfg(json!({ "webhook_url": server.uri() }));
        assert!(dispatcher().send("feishu_webhook", &config, "t", "b").await.is_err());
        // expectation verified on drop
    }

    #[tokio::test]
    async fn test_config_errors_before_network() {
        let err = dispatcher()
            .send("serverchan", &ChannelConfig::new(), "t", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, PushclockError::InvalidChannelConfig { ref field, .. } if field == "token"));

        let err = dispatcher().send("sms", &ChannelConfig::new(), "t", "b").await.unwrap_err();
        assert!(matches!(err, PushclockError::UnsupportedChannel(_)));
    }

    #[test]
    fn test_dingtalk_signed_url() {
        let target = ChannelTarget::DingtalkWebhook {
            webhook_url: "https://oapi.dingtalk.com/robot/send?access_token=abc".into(),
            secret: Some("SEC123".into()),
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let req = build_request(&target, "t", "b", now).unwrap();
        let expected_sign = hmac_base64(b"SEC123", format!("{}\nSEC123", now.timestamp_millis()).as_bytes()).unwrap();
        let url = reqwest::Url::parse(&req.url).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("access_token".into(), "abc".into())));
        assert!(pairs.contains(&("timestamp".into(), now.timestamp_millis().to_string())));
        assert!(pairs.contains(&("sign".into(), expected_sign)));
    }

    #[test]
    fn test_feishu_sign_attached() {
        let target = ChannelTarget::FeishuWebhook {
            webhook_url: "https://open.feishu.cn/open-apis/bot/v2/hook/x".into(),
            secret: Some("s".into()),
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let req = build_request(&target, "Title", "Body", now).unwrap();
        assert_eq!(req.payload["content"]["text"], "Title\nBody");
        assert_eq!(req.payload["timestamp"], now.timestamp().to_string());
        assert_eq!(req.payload["sign"], feishu_sign("s", now.timestamp()).unwrap());
    }

    #[test]
    fn test_provider_codes() {
        assert!(check_provider_response(ChannelKind::PushPlus, &json!({"code": 200})).is_ok());
        assert!(check_provider_response(ChannelKind::PushPlus, &json!({"code": 903, "msg": "bad token"})).is_err());
        assert!(check_provider_response(ChannelKind::ServerChan, &json!({"code": 0})).is_ok());
        assert!(check_provider_response(ChannelKind::FeishuWebhook, &json!({"StatusCode": 0})).is_ok());
        assert!(check_provider_response(ChannelKind::Webhook, &json!({"code": 500})).is_ok());
    }
}
