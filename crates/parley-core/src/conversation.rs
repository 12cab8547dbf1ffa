//! Conversation history sent to the LLM on every turn.

use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered history for one session.
///
/// The first message is the system prompt and never changes; user and
/// assistant messages are only ever appended.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ConversationMessage::new(Role::System, system_prompt)],
        }
    }

    pub fn push_user(&mut self, content: &str) -> Result<()> {
        self.push(Role::User, content)
    }

    pub fn push_assistant(&mut self, content: &str) -> Result<()> {
        self.push(Role::Assistant, content)
    }

    fn push(&mut self, role: Role, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            return Err(ParleyError::Validation(format!(
                "refusing to append empty {role:?} message"
            )));
        }
        self.messages.push(ConversationMessage::new(role, content));
        Ok(())
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn system_prompt(&self) -> &str {
        &self.messages[0].content
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Every message's content joined by newlines: the text counted as prompt input.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message_first_and_fixed() {
        let mut convo = Conversation::new("be brief");
        convo.push_user("hi").unwrap();
        convo.push_assistant("hello").unwrap();
        convo.push_user("bye").unwrap();
        let roles: Vec<Role> = convo.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(convo.system_prompt(), "be brief");
        assert_eq!(convo.len(), 4);
    }

    #[test]
    fn test_rejects_blank_messages() {
        let mut convo = Conversation::new("sys");
        assert!(matches!(
            convo.push_user("   "),
            Err(ParleyError::Validation(_))
        ));
        assert_eq!(convo.len(), 1);
    }

    #[test]
    fn test_prompt_text_joins_with_newlines() {
        let mut convo = Conversation::new("sys");
        convo.push_user("question").unwrap();
        assert_eq!(convo.prompt_text(), "sys\nquestion");
    }

    #[test]
    fn test_role_wire_format() {
        let msg = ConversationMessage::new(Role::Assistant, "ok");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "ok");
    }
}
