//! Pre/post-process hooks run around the agent call in registration order.
//! A pre-process hook may substitute the message before it reaches the
//! session history; a post-process hook may rewrite the reply before it is
//! sent and appended.

use async_trait::async_trait;

use conduit_protocol::UnifiedMessage;

#[async_trait]
pub trait PreProcessHook: Send + Sync {
    async fn run(&self, message: UnifiedMessage) -> UnifiedMessage;
}

#[async_trait]
pub trait PostProcessHook: Send + Sync {
    async fn run(&self, reply: String) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercasePre;

    #[async_trait]
    impl PreProcessHook for UppercasePre {
        async fn run(&self, mut message: UnifiedMessage) -> UnifiedMessage {
            message.plain_text = message.plain_text.to_uppercase();
            message
        }
    }

    #[tokio::test]
    async fn pre_process_hook_substitutes_message() {
        let hook = UppercasePre;
        let msg = UnifiedMessage::text(
            "cli".into(),
            "1",
            "chat".into(),
            "user".into(),
            "user",
            "hi",
        );
        let out = hook.run(msg).await;
        assert_eq!(out.plain_text, "HI");
    }
}
