//! Text Handler pipeline: out-of-band SMS dispatch to script-specific
//! handlers.
//!
//! Grounded on `story_objects.py`'s `Script.process_text`. One deliberate
//! departure from the source: the source never integrates the shard after
//! running its text handler pipeline, which is treated here as an
//! oversight rather than intended behavior. `TextPipeline::run` takes the
//! same `&mut Shard` a voice request would; the caller is expected to
//! enqueue `shard.into_task()` afterward exactly as the voice path does.

use async_trait::async_trait;

use crate::error::StoryResult;
use crate::phone::PhoneId;
use crate::player::ScriptInfo;
use crate::shard::{Shard, SharedState};

/// One handler in a script's text pipeline. Must be idempotent: the voice
/// platform may redeliver the same inbound SMS webhook.
#[async_trait]
pub trait TextHandler<S: SharedState>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        caller: &PhoneId,
        called: &PhoneId,
        body: &str,
        script: &mut ScriptInfo,
        shard: &mut Shard<S>,
    ) -> StoryResult<()>;
}

/// An ordered list of handlers run for every inbound SMS to a player
/// mid-script. Grouped here rather than on `Script` directly so a script's
/// voice routing stays independent of its SMS handling.
pub struct TextPipeline<S: SharedState> {
    handlers: Vec<Box<dyn TextHandler<S>>>,
}

impl<S: SharedState> TextPipeline<S> {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register(&mut self, handler: Box<dyn TextHandler<S>>) {
        self.handlers.push(handler);
    }

    /// Runs every handler in order against `script`'s state and the given
    /// shard, returning the changes the shard recorded so the caller can
    /// enqueue an `AfterRequestActions` task exactly as a voice request
    /// does.
    pub async fn run(
        &self,
        caller: &PhoneId,
        called: &PhoneId,
        body: &str,
        script: &mut ScriptInfo,
        shard: &mut Shard<S>,
    ) -> StoryResult<()> {
        for handler in &self.handlers {
            handler.handle(caller, called, body, script, shard).await?;
        }
        Ok(())
    }
}

impl<S: SharedState> Default for TextPipeline<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::phone::PhoneId;
    use crate::tasks::TaskRunner;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct TestState {
        waiting: Vec<PhoneId>,
    }

    #[async_trait]
    impl SharedState for TestState {
        fn field(&self, name: &str) -> Option<&Vec<PhoneId>> {
            (name == "waiting").then_some(&self.waiting)
        }
        fn field_mut(&mut self, name: &str) -> Option<&mut Vec<PhoneId>> {
            (name == "waiting").then_some(&mut self.waiting)
        }
    }

    struct ReadyHandler;

    #[async_trait]
    impl TextHandler<TestState> for ReadyHandler {
        fn name(&self) -> &str {
            "ready"
        }

        async fn handle(&self, _caller: &PhoneId, _called: &PhoneId, body: &str, script: &mut ScriptInfo, _shard: &mut Shard<TestState>) -> StoryResult<()> {
            if body.trim().eq_ignore_ascii_case("ready") {
                script.data.insert("ready".to_string(), serde_json::Value::Bool(true));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn running_the_pipeline_twice_with_the_same_body_is_idempotent() {
        let kv = Arc::new(MemoryKvStore::new());
        let runner = TaskRunner::spawn();
        let manager = Arc::new(crate::shard::ScriptStateManager::<TestState>::new("test", kv, runner));

        let mut pipeline = TextPipeline::new();
        pipeline.register(Box::new(ReadyHandler));

        let caller = PhoneId::parse("5105551111").unwrap();
        let called = PhoneId::parse("5105552222").unwrap();
        let mut script = ScriptInfo::new();
        let mut shard = manager.shard().await;
        pipeline.run(&caller, &called, "ready", &mut script, &mut shard).await.unwrap();
        pipeline.run(&caller, &called, "ready", &mut script, &mut shard).await.unwrap();

        assert_eq!(script.data.get("ready"), Some(&serde_json::Value::Bool(true)));
    }
}
