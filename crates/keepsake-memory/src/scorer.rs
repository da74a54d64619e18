//! Write-time importance scoring.
//!
//! [`score`] is a pure, deterministic function of the record being written.
//! Starting from [`Importance::NEUTRAL`] it applies:
//!
//! | signal                                        | adjustment        |
//! |-----------------------------------------------|-------------------|
//! | text longer than [`LONG_TEXT_CHARS`]          | `+10`             |
//! | text shorter than [`SHORT_TEXT_CHARS`]        | `-10`             |
//! | strongest emotion dial deviation from neutral | `+0 ..= +20`      |
//! | any [`SIGNIFICANT_TERMS`] present             | `+15`             |
//!
//! The sum is clamped to `[1, 100]`. Any randomness a caller wants for
//! variety must be applied outside this function.

use keepsake_types::{EmotionSnapshot, Importance, MemoryContent, MemoryKind, RecordMetadata};

pub const LONG_TEXT_CHARS: usize = 500;
pub const SHORT_TEXT_CHARS: usize = 50;

const LENGTH_BONUS: i64 = 10;
const EMOTION_MAX_BONUS: f32 = 20.0;
const SIGNIFICANCE_BONUS: i64 = 15;

/// Vocabulary whose presence marks a memory as significant.
pub const SIGNIFICANT_TERMS: &[&str] = &[
    "爱", "喜欢", "重要", "永远", "承诺", "生日", "纪念日", "love", "promise", "birthday",
    "anniversary", "forever", "important",
];

/// Compute the importance of a record at write time.
///
/// `kind` does not currently shift the baseline; every kind is scored on its
/// content and metadata alone.
pub fn score(_kind: &MemoryKind, content: &MemoryContent, metadata: &RecordMetadata) -> Importance {
    let mut delta = 0i64;

    let len = content.text_len();
    if len > LONG_TEXT_CHARS {
        delta += LENGTH_BONUS;
    } else if len < SHORT_TEXT_CHARS {
        delta -= LENGTH_BONUS;
    }

    if let Some(emotion) = emotion_of(content, metadata) {
        delta += (emotion.max_deviation() * EMOTION_MAX_BONUS) as i64;
    }

    if contains_significant_term(&content.text()) {
        delta += SIGNIFICANCE_BONUS;
    }

    Importance::NEUTRAL.adjust(delta)
}

/// Whether `text` mentions any term from [`SIGNIFICANT_TERMS`].
pub fn contains_significant_term(text: &str) -> bool {
    let lowered = text.to_lowercase();
    SIGNIFICANT_TERMS.iter().any(|term| lowered.contains(term))
}

fn emotion_of<'a>(content: &'a MemoryContent, metadata: &'a RecordMetadata) -> Option<&'a EmotionSnapshot> {
    metadata
        .emotion
        .as_ref()
        .filter(|e| !e.is_empty())
        .or(match content {
            MemoryContent::Conversation { context, .. } if !context.emotion.is_empty() => {
                Some(&context.emotion)
            }
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keepsake_types::SituationContext;

    fn conversation(user: &str, agent: &str) -> MemoryContent {
        MemoryContent::Conversation {
            user: user.to_string(),
            agent: agent.to_string(),
            context: SituationContext {
                emotion: EmotionSnapshot::default(),
                timestamp: Utc::now(),
                message_type: "text".to_string(),
            },
        }
    }

    fn medium(extra: &str) -> MemoryContent {
        // 60 characters of neutral text keeps the length adjustment at zero.
        conversation(&format!("{}{extra}", "x".repeat(60)), "")
    }

    #[test]
    fn neutral_medium_text_scores_baseline() {
        let s = score(&MemoryKind::Conversation, &medium(""), &RecordMetadata::default());
        assert_eq!(s, Importance::NEUTRAL);
    }

    #[test]
    fn short_text_is_penalised_and_long_text_rewarded() {
        let meta = RecordMetadata::default();
        let short = score(&MemoryKind::Conversation, &conversation("hi", "hey"), &meta);
        assert_eq!(short.value(), 40);
        let long = score(&MemoryKind::Conversation, &conversation(&"y".repeat(501), ""), &meta);
        assert_eq!(long.value(), 60);
    }

    #[test]
    fn emotion_deviation_adds_up_to_twenty() {
        let mut meta = RecordMetadata::default();
        meta.emotion = Some(EmotionSnapshot::new().with("happiness", 100.0));
        assert_eq!(score(&MemoryKind::Conversation, &medium(""), &meta).value(), 70);

        meta.emotion = Some(EmotionSnapshot::new().with("happiness", 75.0));
        assert_eq!(score(&MemoryKind::Conversation, &medium(""), &meta).value(), 60);
    }

    #[test]
    fn context_emotion_is_used_when_metadata_has_none() {
        let content = match medium("") {
            MemoryContent::Conversation { user, agent, mut context } => {
                context.emotion = EmotionSnapshot::new().with("happiness", 0.0);
                MemoryContent::Conversation { user, agent, context }
            }
            other => other,
        };
        assert_eq!(score(&MemoryKind::Conversation, &content, &RecordMetadata::default()).value(), 70);
    }

    #[test]
    fn significant_terms_add_fifteen() {
        let meta = RecordMetadata::default();
        assert_eq!(score(&MemoryKind::Conversation, &medium(" my birthday"), &meta).value(), 65);
        assert_eq!(score(&MemoryKind::Conversation, &medium("我永远爱你"), &meta).value(), 65);
        assert_eq!(score(&MemoryKind::Conversation, &medium(" I PROMISE"), &meta).value(), 65);
    }

    #[test]
    fn score_is_deterministic_and_in_range() {
        let mut meta = RecordMetadata::default();
        meta.emotion = Some(EmotionSnapshot::new().with("happiness", 0.0));
        let content = conversation(&"love ".repeat(200), "forever");
        let a = score(&MemoryKind::Conversation, &content, &meta);
        let b = score(&MemoryKind::Conversation, &content, &meta);
        assert_eq!(a, b);
        assert_eq!(a.value(), 95);
    }
}
