//! Completion orchestrator
//!
//! Accepts user input, records it in the conversation, and runs one
//! completion at a time against whichever engine is currently ready.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::chat::conversation::Conversation;
use crate::inference::engine::CompletionError;
use crate::inference::lifecycle::EngineManager;
use crate::types::message::Message;

/// Why a send was ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Input was empty or whitespace only
    Blank,
    /// No engine in the `Ready` state
    EngineNotReady,
    /// Another request is still in flight
    Busy,
}

/// Result of one call to [`ChatOrchestrator::send`]
#[derive(Debug)]
pub enum SendOutcome {
    Ignored(IgnoreReason),
    /// The assistant reply that was appended
    Completed(Message),
    /// The user message stays in history; no reply was appended
    Failed(CompletionError),
}

/// Progress of the current send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Idle,
    Sending,
    Completed,
    Failed,
}

/// Conversation plus the send pipeline running against the current engine
pub struct ChatOrchestrator {
    engines: Arc<EngineManager>,
    system_prompt: String,
    conversation: Mutex<Conversation>,
    send_state: watch::Sender<SendState>,
    last_error: watch::Sender<Option<String>>,
}

/// Marks a send as in flight; resets to `Idle` if the send is dropped early
struct InFlight<'a> {
    state: &'a watch::Sender<SendState>,
    finished: bool,
}

impl InFlight<'_> {
    fn finish(mut self, outcome: SendState) {
        self.finished = true;
        self.state.send_replace(outcome);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.state.send_replace(SendState::Idle);
        }
    }
}

/// System instruction, then prior history, then the new user turn
pub fn build_context(system_prompt: &str, history: Vec<Message>, user: Message) -> Vec<Message> {
    let mut context = Vec::with_capacity(history.len() + 2);
    context.push(Message::system(system_prompt));
    context.extend(history);
    context.push(user);
    context
}

impl ChatOrchestrator {
    pub fn new(engines: Arc<EngineManager>, system_prompt: impl Into<String>) -> Self {
        Self {
            engines,
            system_prompt: system_prompt.into(),
            conversation: Mutex::new(Conversation::new()),
            send_state: watch::channel(SendState::Idle).0,
            last_error: watch::channel(None).0,
        }
    }

    pub fn engines(&self) -> &Arc<EngineManager> {
        &self.engines
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Snapshot of the conversation
    pub fn history(&self) -> Vec<Message> {
        self.lock_conversation().snapshot()
    }

    pub fn send_state(&self) -> SendState {
        *self.send_state.borrow()
    }

    pub fn subscribe_send_state(&self) -> watch::Receiver<SendState> {
        self.send_state.subscribe()
    }

    pub fn is_sending(&self) -> bool {
        self.send_state() == SendState::Sending
    }

    /// Whether the send control should be enabled
    pub fn can_send(&self) -> bool {
        !self.is_sending() && self.engines.state().is_ready()
    }

    /// Message of the most recent failed completion, cleared by the next send
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.last_error.subscribe()
    }

    /// Send `text` as a user turn and append the assistant reply.
    ///
    /// Blank input, a missing engine, or a request already in flight make
    /// this a no-op.
    pub async fn send(&self, text: &str, cancel: &CancellationToken) -> SendOutcome {
        if text.trim().is_empty() {
            return SendOutcome::Ignored(IgnoreReason::Blank);
        }
        let Some(engine) = self.engines.current_engine() else {
            tracing::debug!("Ignoring send, engine not ready");
            return SendOutcome::Ignored(IgnoreReason::EngineNotReady);
        };
        let Some(in_flight) = self.begin_send() else {
            tracing::debug!("Ignoring send, request already in flight");
            return SendOutcome::Ignored(IgnoreReason::Busy);
        };
        self.last_error.send_replace(None);

        let user = Message::user(text);
        let context = {
            let mut conversation = self.lock_conversation();
            let history = conversation.snapshot();
            conversation.append(user.clone());
            build_context(&self.system_prompt, history, user)
        };

        tracing::debug!(model = %engine.model(), messages = context.len(), "Requesting completion");
        let result = engine.complete(context, cancel).await.and_then(|completion| {
            // A reply that raced past a model switch belongs to nobody
            if !self.engines.is_current(&engine) {
                return Err(CompletionError::EngineDiscarded);
            }
            completion
                .first_content()
                .map(str::to_owned)
                .ok_or(CompletionError::EmptyResponse)
        });
        drop(engine);

        match result {
            Ok(content) => {
                let reply = Message::assistant(content);
                self.lock_conversation().append(reply.clone());
                in_flight.finish(SendState::Completed);
                SendOutcome::Completed(reply)
            }
            Err(e) => {
                tracing::error!("Completion failed: {}", e);
                self.last_error.send_replace(Some(e.to_string()));
                in_flight.finish(SendState::Failed);
                SendOutcome::Failed(e)
            }
        }
    }

    fn begin_send(&self) -> Option<InFlight<'_>> {
        let started = self.send_state.send_if_modified(|state| {
            if *state == SendState::Sending {
                false
            } else {
                *state = SendState::Sending;
                true
            }
        });
        started.then_some(InFlight {
            state: &self.send_state,
            finished: false,
        })
    }

    fn lock_conversation(&self) -> MutexGuard<'_, Conversation> {
        self.conversation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
