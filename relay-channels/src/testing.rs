//! Scripted provider and recording sink shared by unit tests.

use crate::message::{ConversationId, MessageHandle, ReplyTarget};
use crate::traits::{ChannelError, ChannelResult, Delivery, MessageSink};
use async_trait::async_trait;
use relay_gateway::{
    Balance, ChatRequest, CompletionProvider, CompletionStream, ProviderError, StreamEvent,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One step of a scripted completion stream.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Sleep before the next step.
    Wait(Duration),
    /// Yield an event with these deltas.
    Event(Vec<String>),
    /// Fail the stream.
    Fail(String),
    /// Never yield again.
    Hang,
}

pub(crate) fn wait_ms(ms: u64) -> Step {
    Step::Wait(Duration::from_millis(ms))
}

pub(crate) fn delta(text: &str) -> Step {
    Step::Event(vec![text.to_string()])
}

/// Provider replaying one script per opened stream.
pub(crate) struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    open_error: Option<String>,
    pub(crate) requests: Mutex<Vec<ChatRequest>>,
    pub(crate) closed: Arc<AtomicBool>,
    balance: Option<Balance>,
}

impl ScriptedProvider {
    pub(crate) fn new(script: Vec<Step>) -> Self {
        Self::with_scripts(vec![script])
    }

    pub(crate) fn with_scripts(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            open_error: None,
            requests: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
            balance: None,
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            open_error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn with_balance(mut self, currency: &str, total: &str) -> Self {
        self.balance = Some(Balance {
            currency: currency.into(),
            total_balance: total.into(),
        });
        self
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(
        &self,
        request: ChatRequest,
    ) -> Result<Box<dyn CompletionStream>, ProviderError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        if let Some(message) = &self.open_error {
            return Err(ProviderError::new("scripted", model, message.clone()).with_status(503));
        }
        let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedStream {
            steps: steps.into(),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn balance(&self) -> Result<Balance, ProviderError> {
        self.balance
            .clone()
            .ok_or_else(|| ProviderError::new("scripted", "", "balance not available"))
    }
}

struct ScriptedStream {
    steps: VecDeque<Step>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl CompletionStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>, ProviderError> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                Step::Wait(d) => tokio::time::sleep(d).await,
                Step::Event(deltas) => {
                    return Ok(Some(StreamEvent {
                        deltas,
                        finish_reason: None,
                    }))
                }
                Step::Fail(message) => return Err(ProviderError::new("scripted", "", message)),
                Step::Hang => std::future::pending::<()>().await,
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A call observed by the recording sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Publish { target: ReplyTarget, text: String },
    Update { message_id: i64, text: String },
    Delete { message_id: i64 },
    Typing { conversation: ConversationId },
    SendText { target: ReplyTarget, text: String },
}

/// Sink recording every call with its (virtual) time.
pub(crate) struct RecordingSink {
    calls: Mutex<Vec<(Instant, Call)>>,
    next_id: AtomicI64,
    fail_updates: AtomicBool,
    publish_budget: Mutex<Option<usize>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fail_updates: AtomicBool::new(false),
            publish_budget: Mutex::new(None),
        }
    }

    /// Make every update fail.
    pub(crate) fn failing_updates(self) -> Self {
        self.fail_updates.store(true, Ordering::SeqCst);
        self
    }

    /// Let only `n` publishes succeed.
    pub(crate) fn publish_budget(self, n: usize) -> Self {
        *self.publish_budget.lock().unwrap() = Some(n);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    /// Publish and update attempts with their times.
    pub(crate) fn writes(&self) -> Vec<(Instant, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(at, call)| match call {
                Call::Publish { text, .. } | Call::Update { text, .. } => Some((*at, text.clone())),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SendText { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }

    fn rejected() -> ChannelError {
        ChannelError::Api {
            code: 400,
            description: "Bad Request: message to edit not found".into(),
        }
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn publish(&self, target: &ReplyTarget, text: &str) -> ChannelResult<Delivery> {
        self.record(Call::Publish {
            target: *target,
            text: text.to_string(),
        });
        {
            let mut budget = self.publish_budget.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err(ChannelError::SendFailed("publish refused".into()));
                }
                *left -= 1;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Delivery::direct(MessageHandle::new(target.conversation, id)))
    }

    async fn update(&self, handle: &MessageHandle, text: &str) -> ChannelResult<Delivery> {
        self.record(Call::Update {
            message_id: handle.message_id,
            text: text.to_string(),
        });
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Self::rejected());
        }
        Ok(Delivery::direct(*handle))
    }

    async fn delete(&self, handle: &MessageHandle) -> ChannelResult<()> {
        self.record(Call::Delete {
            message_id: handle.message_id,
        });
        Err(Self::rejected())
    }

    async fn notify_typing(&self, conversation: ConversationId) -> ChannelResult<()> {
        self.record(Call::Typing { conversation });
        Ok(())
    }

    async fn send_text(&self, target: &ReplyTarget, text: &str) -> ChannelResult<()> {
        self.record(Call::SendText {
            target: *target,
            text: text.to_string(),
        });
        Ok(())
    }
}
