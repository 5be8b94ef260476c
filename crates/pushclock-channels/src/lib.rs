//! # Pushclock Channels
//! Channel Dispatcher: renders a message and delivers it to one push channel.
//!
//! Supported channels: generic webhook, WeCom webhook, Feishu webhook,
//! DingTalk webhook, PushPlus, ServerChan, Bark.

pub mod dispatch;
pub mod target;
pub mod template;

pub use dispatch::ChannelDispatcher;
pub use target::{ChannelKind, ChannelTarget};
