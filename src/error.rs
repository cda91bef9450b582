use thiserror::Error;

pub const PROMPT_TOO_LONG_PREFIX: &str = "LOCAL_PROMPT_TOO_LONG";

#[derive(Debug, Clone, Copy, Error)]
#[error("translation cancelled")]
pub struct TranslationCancelled;

#[derive(Debug, Clone, Error)]
#[error("LOCAL_PROMPT_TOO_LONG: {detail}")]
pub struct LocalPromptTooLong {
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BatchParseError {
    #[error("response ended mid-JSON; raise max_tokens / ctx_size")]
    Truncated,
    #[error("could not parse batch translation response")]
    Unrecognized,
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<TranslationCancelled>())
}

pub fn is_prompt_too_long(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<LocalPromptTooLong>() || cause.to_string().contains(PROMPT_TOO_LONG_PREFIX)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn cancellation_survives_context() {
        let err = Err::<(), _>(TranslationCancelled)
            .context("batch 2")
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(!is_prompt_too_long(&err));
    }

    #[test]
    fn prompt_too_long_is_recognized_by_type_and_message() {
        let typed = anyhow::Error::new(LocalPromptTooLong {
            detail: "context length exceeded".to_string(),
        });
        assert!(is_prompt_too_long(&typed));
        assert_eq!(
            typed.to_string(),
            "LOCAL_PROMPT_TOO_LONG: context length exceeded"
        );

        let plain = anyhow::anyhow!("LOCAL_PROMPT_TOO_LONG: n_ctx");
        assert!(is_prompt_too_long(&plain));
    }
}
