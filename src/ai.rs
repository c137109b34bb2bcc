//! Placeholder assistant features. Replies and drafts are fixed templates until a model is wired in.

use crate::models::EmailRecord;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Professional,
    Friendly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuickReply {
    pub tone: Tone,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Draft {
    pub email_text: String,
}

pub fn quick_replies(_email: &EmailRecord) -> Vec<QuickReply> {
    vec![
        QuickReply {
            tone: Tone::Professional,
            text: "Thank you for reaching out. I'll review this and get back to you shortly."
                .to_string(),
        },
        QuickReply {
            tone: Tone::Friendly,
            text: "Thanks! I'll take a look and let you know.".to_string(),
        },
    ]
}

pub fn compose(prompt: &str, signature: &str) -> Draft {
    Draft {
        email_text: format!(
            "[AI Generated based on: {}]\n\nHello,\n\nThank you for your message.\n\nBest regards,\n{}",
            prompt.trim(),
            signature
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record() -> EmailRecord {
        let now = Utc::now();
        EmailRecord {
            id: 1,
            user_id: 1,
            account_id: Some(1),
            message_id: "<a@b>".to_string(),
            from_address: "a@example.com".to_string(),
            from_name: None,
            to_address: None,
            subject: "hi".to_string(),
            body_text: Some("hello".to_string()),
            body_html: None,
            ai_summary: None,
            ai_category: Some("primary".to_string()),
            is_read: false,
            is_starred: false,
            is_archived: false,
            received_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn replies_cover_both_tones() {
        let replies = quick_replies(&record());
        let tones: Vec<Tone> = replies.iter().map(|r| r.tone).collect();
        assert_eq!(tones, vec![Tone::Professional, Tone::Friendly]);

        let json = serde_json::to_value(&replies[0]).unwrap();
        assert_eq!(json["tone"], "professional");
    }

    #[test]
    fn compose_embeds_prompt_and_signature() {
        let draft = compose("  ask for the invoice ", "Jane");
        assert!(draft.email_text.starts_with("[AI Generated based on: ask for the invoice]"));
        assert!(draft.email_text.ends_with("Best regards,\nJane"));
    }
}
