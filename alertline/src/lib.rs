/// Alertline - real-time trading alert delivery
///
/// This library provides the pieces the `alertline-desk` binary is assembled from:
/// - transport: one shared WebSocket per endpoint, fanned out to many subscribers
/// - request: retry with exponential backoff and uniform error classification for REST calls
/// - notification: REST snapshot and push stream merged into one deduplicated view
/// - voice: serialised, priority-ordered spoken alerts with remote and local synthesis
///
/// The library also includes:
/// - REST client for the alerting backend
/// - Durable local state (dismissed notifications, layout preference)
/// - Environment-driven configuration
pub mod api;
pub mod config;
pub mod notification;
pub mod request;
pub mod storage;
pub mod transport;
pub mod voice;

// Re-export commonly used types for convenience
pub use api::{BackendApi, HealthStatus, ProviderStatus, SynthesisRequest, SynthesisResponse};
pub use config::AlertlineConfig;

pub use notification::{
    Notification, NotificationBackend, NotificationCenter, NotificationError, Priority,
};
pub use request::{ApiError, ErrorCategory, RequestClient, RetryConfig};
pub use storage::{LayoutPreference, LocalStore};

pub use transport::{
    ConnectionHandle, ConnectionManager, ConnectionStatus, Payload, Subscriber, TransportConfig,
    TransportEvent,
};

pub use voice::{
    CommandAudioPlayer, FallbackSpeech, LocalSpeechProvider, RemoteSpeechProvider, SpeechError,
    SpeechProvider, VoiceAlertQueue,
};
