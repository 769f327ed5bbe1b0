//! The closed delivery-channel variant and its capability interface.

use async_trait::async_trait;
use serde_json::Value;

/// The closed set of delivery channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Channel {
    Whatsapp,
    Telegram,
    Email,
    Sheets,
    Push,
}

pub const ALL_CHANNELS: [Channel; 5] = [
    Channel::Whatsapp,
    Channel::Telegram,
    Channel::Email,
    Channel::Sheets,
    Channel::Push,
];

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Telegram => "telegram",
            Channel::Email => "email",
            Channel::Sheets => "sheets",
            Channel::Push => "push",
        }
    }

    pub fn parse(name: &str) -> Option<Channel> {
        match name {
            "whatsapp" => Some(Channel::Whatsapp),
            "telegram" => Some(Channel::Telegram),
            "email" => Some(Channel::Email),
            "sheets" => Some(Channel::Sheets),
            "push" => Some(Channel::Push),
            _ => None,
        }
    }

    /// Payload keys (in preference order) carrying a contact address for
    /// this channel. `Sheets` has no contact-address concept — it is a
    /// destination record, not a person to reach.
    pub fn contact_keys(&self) -> &'static [&'static str] {
        match self {
            Channel::Whatsapp => &["whatsapp", "phone", "mobile", "phone_number"],
            Channel::Telegram => &["telegram", "telegram_chat_id", "chat_id"],
            Channel::Email => &["email", "email_address"],
            Channel::Push => &["subscription", "push_subscription"],
            Channel::Sheets => &[],
        }
    }

    pub fn requires_contact(&self) -> bool {
        !self.contact_keys().is_empty()
    }
}

pub fn extract_contact(payload: &Value, channel: Channel) -> Option<String> {
    for key in channel.contact_keys() {
        if let Some(value) = payload.get(*key) {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// A channel-specific delivery capability. The dispatcher loop itself is
/// channel-agnostic; each `Channel` resolves to a transport implementing
/// this trait.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn deliver(&self, contact: &str, message: &str) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_round_trips_as_str() {
        for channel in ALL_CHANNELS {
            assert_eq!(Channel::parse(channel.as_str()), Some(channel));
        }
    }

    #[test]
    fn extract_contact_prefers_first_present_key() {
        let payload = json!({"mobile": "123", "phone": "456"});
        assert_eq!(
            extract_contact(&payload, Channel::Whatsapp).as_deref(),
            Some("123")
        );
    }

    #[test]
    fn sheets_never_requires_contact() {
        assert!(!Channel::Sheets.requires_contact());
        assert!(Channel::Email.requires_contact());
    }
}
