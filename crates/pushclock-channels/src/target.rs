//! Channel kinds and their validated configurations.

use std::fmt;
use std::str::FromStr;

use pushclock_core::error::{PushclockError, Result};
use pushclock_core::types::ChannelConfig;

/// Closed set of supported channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Webhook,
    WecomWebhook,
    FeishuWebhook,
    DingtalkWebhook,
    PushPlus,
    ServerChan,
    Bark,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 7] = [
        Self::Webhook,
        Self::WecomWebhook,
        Self::FeishuWebhook,
        Self::DingtalkWebhook,
        Self::PushPlus,
        Self::ServerChan,
        Self::Bark,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::WecomWebhook => "wecom_webhook",
            Self::FeishuWebhook => "feishu_webhook",
            Self::DingtalkWebhook => "dingtalk_webhook",
            Self::PushPlus => "pushplus",
            Self::ServerChan => "serverchan",
            Self::Bark => "bark",
        }
    }

    /// Config keys that must be present and non-empty.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Webhook => &["url"],
            Self::WecomWebhook | Self::FeishuWebhook | Self::DingtalkWebhook => &["webhook_url"],
            Self::PushPlus | Self::ServerChan => &["token"],
            Self::Bark => &["device_key"],
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = PushclockError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PushclockError::UnsupportedChannel(s.to_string()))
    }
}

/// HTTP verb for the generic webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookMethod {
    Post,
    Put,
}

/// A channel with its typed configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelTarget {
    Webhook {
        url: String,
        method: WebhookMethod,
        headers: Vec<(String, String)>,
    },
    WecomWebhook {
        webhook_url: String,
        markdown: bool,
    },
    FeishuWebhook {
        webhook_url: String,
        secret: Option<String>,
    },
    DingtalkWebhook {
        webhook_url: String,
        secret: Option<String>,
    },
    PushPlus {
        token: String,
        template: String,
        topic: Option<String>,
    },
    ServerChan {
        token: String,
    },
    Bark {
        server: String,
        device_key: String,
        sound: Option<String>,
        group: Option<String>,
    },
}

impl ChannelTarget {
    /// Validate an opaque config map against the channel's schema.
    pub fn parse(channel: &str, config: &ChannelConfig) -> Result<Self> {
        let kind: ChannelKind = channel.parse()?;
        let fields = Fields { kind, config };

        let target = match kind {
            ChannelKind::Webhook => {
                let method = match fields.optional("method")?.as_deref() {
                    None => WebhookMethod::Post,
                    Some(m) if m.eq_ignore_ascii_case("post") => WebhookMethod::Post,
                    Some(m) if m.eq_ignore_ascii_case("put") => WebhookMethod::Put,
                    Some(_) => return Err(PushclockError::missing_field(kind.as_str(), "method")),
                };
                Self::Webhook {
                    url: fields.required("url")?,
                    method,
                    headers: fields.headers()?,
                }
            }
            ChannelKind::WecomWebhook => Self::WecomWebhook {
                webhook_url: fields.required("webhook_url")?,
                markdown: fields.optional("msg_type")?.as_deref() == Some("markdown"),
            },
            ChannelKind::FeishuWebhook => Self::FeishuWebhook {
                webhook_url: fields.required("webhook_url")?,
                secret: fields.optional("secret")?,
            },
            ChannelKind::DingtalkWebhook => Self::DingtalkWebhook {
                webhook_url: fields.required("webhook_url")?,
                secret: fields.optional("secret")?,
            },
            ChannelKind::PushPlus => Self::PushPlus {
                token: fields.required("token")?,
                template: fields.optional("template")?.unwrap_or_else(|| "html".into()),
                topic: fields.optional("topic")?,
            },
            ChannelKind::ServerChan => Self::ServerChan {
                token: fields.required("token")?,
            },
            ChannelKind::Bark => Self::Bark {
                server: fields
                    .optional("server")?
                    .map(|s| s.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| "https://api.day.app".into()),
                device_key: fields.required("device_key")?,
                sound: fields.optional("sound")?,
                group: fields.optional("group")?,
            },
        };
        Ok(target)
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Webhook { .. } => ChannelKind::Webhook,
            Self::WecomWebhook { .. } => ChannelKind::WecomWebhook,
            Self::FeishuWebhook { .. } => ChannelKind::FeishuWebhook,
            Self::DingtalkWebhook { .. } => ChannelKind::DingtalkWebhook,
            Self::PushPlus { .. } => ChannelKind::PushPlus,
            Self::ServerChan { .. } => ChannelKind::ServerChan,
            Self::Bark { .. } => ChannelKind::Bark,
        }
    }
}

/// Typed accessors over a raw config map.
struct Fields<'a> {
    kind: ChannelKind,
    config: &'a ChannelConfig,
}

impl Fields<'_> {
    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)?
            .ok_or_else(|| PushclockError::missing_field(self.kind.as_str(), key))
    }

    /// Blank strings count as absent; non-string values are rejected.
    fn optional(&self, key: &str) -> Result<Option<String>> {
        match self.config.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(PushclockError::missing_field(self.kind.as_str(), key)),
        }
    }

    fn headers(&self) -> Result<Vec<(String, String)>> {
        match self.config.get("headers") {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(serde_json::Value::Object(map)) => Ok(map
                .iter()
                .map(|(k, v)| {
                    let value = v.as_str().map(String::from).unwrap_or_else(|| v.to_string());
                    (k.clone(), value)
                })
                .collect()),
            Some(_) => Err(PushclockError::missing_field(self.kind.as_str(), "headers")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(value: serde_json::Value) -> ChannelConfig {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let err = ChannelTarget::parse("carrier_pigeon", &ChannelConfig::new()).unwrap_err();
        assert!(matches!(err, PushclockError::UnsupportedChannel(ref c) if c == "carrier_pigeon"));
    }

    #[test]
    fn test_missing_required_field_named() {
        for kind in ChannelKind::ALL {
            let err = ChannelTarget::parse(kind.as_str(), &ChannelConfig::new()).unwrap_err();
            match err {
                PushclockError::InvalidChannelConfig { channel, field } => {
                    assert_eq!(channel, kind.as_str());
                    assert_eq!(field, kind.required_fields()[0]);
                }
                other => panic!("unexpected error for {kind}: {other}"),
            }
        }
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let err = ChannelTarget::parse("pushplus", &cfg(json!({"token": "  "}))).unwrap_err();
        assert!(matches!(err, PushclockError::InvalidChannelConfig { ref field, .. } if field == "token"));
    }

    #[test]
    fn test_webhook_with_headers() {
        let target = ChannelTarget::parse(
            "webhook",
            &cfg(json!({"url": "https://hooks.example.com/x", "method": "put", "headers": {"X-Key": "k"}})),
        )
        .unwrap();
        assert_eq!(
            target,
            ChannelTarget::Webhook {
                url: "https://hooks.example.com/x".into(),
                method: WebhookMethod::Put,
                headers: vec![("X-Key".into(), "k".into())],
            }
        );
    }

    #[test]
    fn test_bark_defaults() {
        let target = ChannelTarget::parse("bark", &cfg(json!({"device_key": "abc"}))).unwrap();
        match target {
            ChannelTarget::Bark { server, .. } => assert_eq!(server, "https://api.day.app"),
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in ChannelKind::ALL {
            assert_eq!(kind.as_str().parse::<ChannelKind>().unwrap(), kind);
        }
    }
}
