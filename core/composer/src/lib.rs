pub mod providers;
pub mod synthesizer;
pub mod templates;

pub use providers::{ChatProvider, ChatRole, ChatTurn, EndpointConfig, ProviderConfig, ProviderError};
pub use synthesizer::{Reply, ReplyFailurePolicy, ReplySynthesizer, SynthesisError, HISTORY_WINDOW};
pub use templates::{PromptRenderer, NOTIFICATION_PARAMS};
