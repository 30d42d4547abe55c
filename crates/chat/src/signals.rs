use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use colloquy_storage::{
    ConversationId, ConversationSettings, ConversationSummary, Message, MessageId,
    MessageMetadata,
};
use serde::Serialize;
use tokio::sync::mpsc;

/// Every signal the chat core can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    MessageCreated,
    StreamStarted,
    StreamChunk,
    StreamError,
    StreamComplete,
    ConversationTitleChanged,
    ConversationCreated,
    ConversationArchived,
    ConversationRestored,
    ConversationPurged,
    ConversationSettingsChanged,
}

impl SignalKind {
    pub const ALL: [SignalKind; 11] = [
        SignalKind::MessageCreated,
        SignalKind::StreamStarted,
        SignalKind::StreamChunk,
        SignalKind::StreamError,
        SignalKind::StreamComplete,
        SignalKind::ConversationTitleChanged,
        SignalKind::ConversationCreated,
        SignalKind::ConversationArchived,
        SignalKind::ConversationRestored,
        SignalKind::ConversationPurged,
        SignalKind::ConversationSettingsChanged,
    ];

    /// Wire name seen by bus subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageCreated => "message-created",
            Self::StreamStarted => "stream-started",
            Self::StreamChunk => "stream-chunk",
            Self::StreamError => "stream-error",
            Self::StreamComplete => "stream-complete",
            Self::ConversationTitleChanged => "conversation-title-changed",
            Self::ConversationCreated => "conversation-created",
            Self::ConversationArchived => "conversation-archived",
            Self::ConversationRestored => "conversation-restored",
            Self::ConversationPurged => "conversation-purged",
            Self::ConversationSettingsChanged => "conversation-settings-changed",
        }
    }
}

/// Emitted after a user message is persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageCreated {
    pub conversation_id: ConversationId,
    pub message: Message,
}

/// Emitted once the assistant placeholder exists and a stream is about to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStarted {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub provider: String,
    pub model: String,
}

/// Emitted for every non-empty content delta that was appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamChunk {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub delta: String,
}

/// Terminal failure of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamError {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub error: String,
    pub status_code: Option<u16>,
}

/// Terminal success (or user cancellation) of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamComplete {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTitleChanged {
    pub conversation_id: ConversationId,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationCreated {
    pub summary: ConversationSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationArchived {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationRestored {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationPurged {
    pub conversation_id: ConversationId,
}

/// Emitted when provider or model of a conversation changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSettingsChanged {
    pub conversation_id: ConversationId,
    pub settings: ConversationSettings,
}

/// One published signal with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", content = "payload", rename_all = "kebab-case")]
pub enum ChatEvent {
    MessageCreated(MessageCreated),
    StreamStarted(StreamStarted),
    StreamChunk(StreamChunk),
    StreamError(StreamError),
    StreamComplete(StreamComplete),
    ConversationTitleChanged(ConversationTitleChanged),
    ConversationCreated(ConversationCreated),
    ConversationArchived(ConversationArchived),
    ConversationRestored(ConversationRestored),
    ConversationPurged(ConversationPurged),
    ConversationSettingsChanged(ConversationSettingsChanged),
}

/// Binds a payload type to exactly one signal.
pub trait SignalPayload {
    const KIND: SignalKind;

    fn into_event(self) -> ChatEvent;
}

macro_rules! bind_signal {
    ($($payload:ident),+ $(,)?) => {
        $(
            impl SignalPayload for $payload {
                const KIND: SignalKind = SignalKind::$payload;

                fn into_event(self) -> ChatEvent {
                    ChatEvent::$payload(self)
                }
            }
        )+

        impl ChatEvent {
            pub fn kind(&self) -> SignalKind {
                match self {
                    $(Self::$payload(_) => SignalKind::$payload,)+
                }
            }
        }
    };
}

bind_signal!(
    MessageCreated,
    StreamStarted,
    StreamChunk,
    StreamError,
    StreamComplete,
    ConversationTitleChanged,
    ConversationCreated,
    ConversationArchived,
    ConversationRestored,
    ConversationPurged,
    ConversationSettingsChanged,
);

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageCreated(event) => &event.conversation_id,
            Self::StreamStarted(event) => &event.conversation_id,
            Self::StreamChunk(event) => &event.conversation_id,
            Self::StreamError(event) => &event.conversation_id,
            Self::StreamComplete(event) => &event.conversation_id,
            Self::ConversationTitleChanged(event) => &event.conversation_id,
            Self::ConversationCreated(event) => &event.summary.id,
            Self::ConversationArchived(event) => &event.conversation_id,
            Self::ConversationRestored(event) => &event.conversation_id,
            Self::ConversationPurged(event) => &event.conversation_id,
            Self::ConversationSettingsChanged(event) => &event.conversation_id,
        }
    }
}

/// Host-side sink for published signals.
pub trait EventBus: Send + Sync {
    fn emit(&self, name: &'static str, event: &ChatEvent);
}

/// Forwards events into a channel; a dropped receiver silently discards them.
pub struct ChannelEventBus {
    sender: mpsc::UnboundedSender<ChatEvent>,
}

impl ChannelEventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventBus for ChannelEventBus {
    fn emit(&self, _name: &'static str, event: &ChatEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Logs each event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventBus;

impl EventBus for TracingEventBus {
    fn emit(&self, name: &'static str, event: &ChatEvent) {
        tracing::debug!(
            signal = name,
            conversation_id = %event.conversation_id(),
            "chat signal"
        );
    }
}

/// Registry of signal names plus the bus they are published on.
///
/// Publishing without a bus is a no-op, and so is publishing a kind that was
/// never registered.
pub struct SignalRegistry {
    bus: Option<Arc<dyn EventBus>>,
    registered: Mutex<BTreeSet<SignalKind>>,
}

impl SignalRegistry {
    pub fn new(bus: Option<Arc<dyn EventBus>>) -> Self {
        Self {
            bus,
            registered: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_bus(bus: Arc<dyn EventBus>) -> Self {
        Self::new(Some(bus))
    }

    /// Registry without a bus; every publish is dropped.
    pub fn detached() -> Self {
        Self::new(None)
    }

    pub fn has_bus(&self) -> bool {
        self.bus.is_some()
    }

    /// Reserves `kind`. Returns `false` when it was already registered.
    pub fn register(&self, kind: SignalKind) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind)
    }

    pub fn register_payload<P: SignalPayload>(&self) -> bool {
        self.register(P::KIND)
    }

    pub fn register_all(&self) {
        for kind in SignalKind::ALL {
            self.register(kind);
        }
    }

    pub fn is_registered(&self, kind: SignalKind) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&kind)
    }

    pub fn registered(&self) -> Vec<SignalKind> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn publish<P: SignalPayload>(&self, payload: P) {
        self.emit(payload.into_event());
    }

    pub fn emit(&self, event: ChatEvent) {
        let Some(bus) = self.bus.as_ref() else {
            return;
        };

        let kind = event.kind();
        if !self.is_registered(kind) {
            tracing::warn!(signal = kind.name(), "dropping unregistered chat signal");
            return;
        }

        bus.emit(kind.name(), &event);
    }
}

impl Default for SignalRegistry {
    fn default() -> Self {
        Self::detached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archived(raw: &str) -> ConversationArchived {
        ConversationArchived {
            conversation_id: ConversationId::parse(raw).unwrap(),
        }
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = SignalRegistry::detached();
        assert!(registry.register(SignalKind::StreamChunk));
        assert!(!registry.register(SignalKind::StreamChunk));
        assert!(!registry.register_payload::<StreamChunk>());
        assert_eq!(registry.registered(), vec![SignalKind::StreamChunk]);
    }

    #[test]
    fn registered_events_reach_the_bus() {
        let (bus, mut events) = ChannelEventBus::new();
        let registry = SignalRegistry::with_bus(Arc::new(bus));
        registry.register_payload::<ConversationArchived>();

        registry.publish(archived("conv-1"));

        let event = events.try_recv().unwrap();
        assert_eq!(event.name(), "conversation-archived");
        assert_eq!(event.conversation_id().as_str(), "conv-1");
    }

    #[test]
    fn unregistered_events_are_dropped() {
        let (bus, mut events) = ChannelEventBus::new();
        let registry = SignalRegistry::with_bus(Arc::new(bus));

        registry.publish(archived("conv-1"));

        assert!(events.try_recv().is_err());
    }

    #[test]
    fn publishing_without_a_bus_is_a_no_op() {
        let registry = SignalRegistry::detached();
        registry.register_all();
        registry.publish(archived("conv-1"));
        assert!(!registry.has_bus());
    }

    #[test]
    fn events_serialize_with_their_wire_name() {
        let value = serde_json::to_value(archived("conv-9").into_event()).unwrap();
        assert_eq!(value["signal"], "conversation-archived");
        assert_eq!(value["payload"]["conversation_id"], "conv-9");
    }

    #[test]
    fn every_kind_has_a_distinct_name() {
        let names = SignalKind::ALL
            .iter()
            .map(SignalKind::name)
            .collect::<BTreeSet<_>>();
        assert_eq!(names.len(), SignalKind::ALL.len());
    }
}
