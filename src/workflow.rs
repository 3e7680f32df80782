//! Fixed two-step chat pipeline: retrieve context, then generate an answer.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::embedder::Embedder;
use crate::llm::{ChatMessage, ChatModel};
use crate::vector_store::VectorStore;

/// Documents fetched per question unless overridden.
pub const DEFAULT_TOP_K: usize = 5;

/// Reply used when the chat model fails.
pub const FALLBACK_REPLY: &str =
    "I apologize, but I encountered an error while processing your request.";

const NO_CONTEXT: &str = "No relevant information found.";

/// State threaded through the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    /// Conversation so far, oldest first, ending with the latest reply.
    pub messages: Vec<ChatMessage>,
    /// Document texts retrieved for the latest question.
    pub context: Vec<String>,
}

impl ChatState {
    /// Content of the last message, normally the assistant reply.
    pub fn last_reply(&self) -> Option<&str> {
        self.messages.last().map(|message| message.content.as_str())
    }
}

/// Output of a single pipeline step, emitted by [`Workflow::stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum NodeUpdate {
    /// The retrieve step finished.
    Retrieve {
        /// Texts that will be placed in the prompt.
        context: Vec<String>,
    },
    /// The generate step finished.
    Generate {
        /// Assistant reply appended to the conversation.
        reply: ChatMessage,
    },
}

/// Per-thread conversation memory.
#[derive(Debug, Default)]
pub struct MemorySaver {
    threads: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl MemorySaver {
    /// Empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// History stored for `thread_id`, empty when unknown.
    pub fn load(&self, thread_id: &str) -> Vec<ChatMessage> {
        self.threads
            .lock()
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the history for `thread_id`.
    pub fn save(&self, thread_id: &str, messages: Vec<ChatMessage>) {
        self.threads.lock().insert(thread_id.to_string(), messages);
    }

    /// Forgets `thread_id`.
    pub fn clear(&self, thread_id: &str) {
        self.threads.lock().remove(thread_id);
    }

    /// Number of threads with stored history.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}

/// `retrieve -> generate` pipeline with conversation memory.
pub struct Workflow<E, V, M> {
    embedder: E,
    store: Option<V>,
    model: M,
    memory: MemorySaver,
    top_k: usize,
}

impl<E, V, M> Workflow<E, V, M>
where
    E: Embedder,
    V: VectorStore,
    M: ChatModel,
{
    /// Builds a workflow. A missing store makes every retrieval come back empty.
    pub fn new(embedder: E, store: Option<V>, model: M) -> Self {
        tracing::info!(has_store = store.is_some(), "building chat workflow");
        Self {
            embedder,
            store,
            model,
            memory: MemorySaver::new(),
            top_k: DEFAULT_TOP_K,
        }
    }

    /// Overrides how many documents are retrieved per question.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Conversation memory shared by all threads.
    pub fn memory(&self) -> &MemorySaver {
        &self.memory
    }

    /// Runs the pipeline once. History is kept only when `thread_id` is given.
    pub fn invoke(&self, input: &str, thread_id: Option<&str>) -> ChatState {
        self.stream(input, thread_id, |_| {})
    }

    /// Runs the pipeline, calling `on_update` after each step completes.
    pub fn stream<F>(&self, input: &str, thread_id: Option<&str>, mut on_update: F) -> ChatState
    where
        F: FnMut(NodeUpdate),
    {
        if let Some(thread) = thread_id {
            tracing::debug!(thread, "running workflow");
        }
        let mut state = ChatState {
            messages: thread_id
                .map(|thread| self.memory.load(thread))
                .unwrap_or_default(),
            context: Vec::new(),
        };
        state.messages.push(ChatMessage::user(input));

        state.context = self.retrieve(&state);
        on_update(NodeUpdate::Retrieve {
            context: state.context.clone(),
        });

        let reply = self.generate(&state);
        state.messages.push(reply.clone());
        on_update(NodeUpdate::Generate { reply });

        if let Some(thread) = thread_id {
            self.memory.save(thread, state.messages.clone());
        }
        state
    }

    fn retrieve(&self, state: &ChatState) -> Vec<String> {
        let Some(last) = state.messages.last() else {
            tracing::warn!("no messages in state; skipping retrieval");
            return Vec::new();
        };
        let Some(store) = &self.store else {
            tracing::warn!("vector store not available; answering without context");
            return Vec::new();
        };
        tracing::info!(query = %last.content, "retrieving context");
        let hits = self
            .embedder
            .embed_one(&last.content)
            .and_then(|query| store.similarity_search(&query, self.top_k));
        match hits {
            Ok(hits) => {
                tracing::info!("retrieved {} documents", hits.len());
                hits.into_iter().map(|hit| hit.text).collect()
            }
            Err(err) => {
                tracing::error!("retrieval failed: {err:#}");
                Vec::new()
            }
        }
    }

    fn generate(&self, state: &ChatState) -> ChatMessage {
        let mut prompt = Vec::with_capacity(state.messages.len() + 1);
        prompt.push(ChatMessage::system(system_prompt(&state.context)));
        prompt.extend(state.messages.iter().cloned());
        match self.model.complete(&prompt) {
            Ok(answer) => {
                tracing::info!("response generated");
                ChatMessage::assistant(answer)
            }
            Err(err) => {
                tracing::error!("generation failed: {err:#}");
                ChatMessage::assistant(FALLBACK_REPLY)
            }
        }
    }
}

/// Support-assistant instructions with the retrieved context inlined.
pub fn system_prompt(context: &[String]) -> String {
    let context_block = if context.is_empty() {
        NO_CONTEXT.to_string()
    } else {
        context.join("\n\n")
    };
    let mut prompt = String::new();
    prompt.push_str("You are a helpful customer support assistant.\n");
    prompt.push_str("Use the following context to answer the user's question.\n");
    prompt.push_str("If the answer is not in the context, politely say that you don't have the answer and suggest contacting human support at support@example.com.\n");
    prompt.push_str("Keep your answers concise and helpful.\n\n");
    prompt.push_str("Context:\n");
    prompt.push_str(&context_block);
    prompt.push('\n');
    prompt
}
