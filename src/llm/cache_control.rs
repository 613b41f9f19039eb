//! Prompt cache markers for providers that support explicit caching.
//!
//! Only the last message of the conversation carries a marker. Markers on
//! earlier messages are cleared so repeated calls over a growing
//! conversation never accumulate stale markers. The input is left untouched;
//! a rewritten copy is returned.

use serde::{Deserialize, Serialize};

use super::message::{CacheControl, ContentPart, Message, MessageContent};

/// Where cache markers are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheControlMode {
    /// Mark the end of the conversation (the last message).
    DefaultEnd,
}

/// Return a copy of `messages` with a cache marker on the last message only.
pub fn set_cache_control(messages: &[Message], mode: CacheControlMode) -> Vec<Message> {
    match mode {
        CacheControlMode::DefaultEnd => {
            let mut marked: Vec<Message> = messages.to_vec();
            let last = marked.len().saturating_sub(1);
            for (index, message) in marked.iter_mut().enumerate() {
                clear_marker(message);
                if index == last {
                    set_marker(message);
                }
            }
            marked
        }
    }
}

fn clear_marker(message: &mut Message) {
    if let MessageContent::Parts(parts) = &mut message.content {
        for part in parts.iter_mut() {
            part.cache_control = None;
        }
    }
}

fn set_marker(message: &mut Message) {
    match &mut message.content {
        MessageContent::Text(text) => {
            let mut part = ContentPart::text(std::mem::take(text));
            part.cache_control = Some(CacheControl::ephemeral());
            message.content = MessageContent::Parts(vec![part]);
        }
        MessageContent::Parts(parts) => match parts.first_mut() {
            Some(first) => first.cache_control = Some(CacheControl::ephemeral()),
            None => {
                let mut part = ContentPart::text(String::new());
                part.cache_control = Some(CacheControl::ephemeral());
                parts.push(part);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker_of(message: &Message) -> Option<CacheControl> {
        match &message.content {
            MessageContent::Parts(parts) => parts[0].cache_control.clone(),
            MessageContent::Text(_) => None,
        }
    }

    #[test]
    fn test_only_last_message_is_marked() {
        let messages = vec![
            Message::system("system"),
            Message::user("task"),
            Message::assistant("reply"),
            Message::user("observation"),
        ];
        let marked = set_cache_control(&messages, CacheControlMode::DefaultEnd);

        assert_eq!(&marked[..3], &messages[..3]);
        assert_eq!(marker_of(&marked[3]), Some(CacheControl::ephemeral()));
        assert_eq!(marked[3].text(), "observation");
        assert_eq!(messages[3].content, MessageContent::Text("observation".to_string()));
    }

    #[test]
    fn test_previous_markers_are_cleared() {
        let first = set_cache_control(
            &[Message::system("s"), Message::user("u1")],
            CacheControlMode::DefaultEnd,
        );
        let mut conversation = first;
        conversation.push(Message::assistant("a"));
        conversation.push(Message::user("u2"));

        let marked = set_cache_control(&conversation, CacheControlMode::DefaultEnd);
        assert_eq!(marker_of(&marked[1]), None);
        assert_eq!(marked[1].text(), "u1");
        assert_eq!(marker_of(&marked[3]), Some(CacheControl::ephemeral()));
    }

    #[test]
    fn test_empty_conversation() {
        assert!(set_cache_control(&[], CacheControlMode::DefaultEnd).is_empty());
    }

    #[test]
    fn test_mode_deserializes_from_snake_case() {
        let mode: CacheControlMode = serde_json::from_str("\"default_end\"").unwrap();
        assert_eq!(mode, CacheControlMode::DefaultEnd);
    }
}
