// src/lib.rs

// Import the top-level `concord` module.
pub mod concord;

// Re-exporting key items (and the modules themselves) for easier external access.
pub use concord::client_wrapper::{self, ChatMessage, ChatRole, GatewayClient, GatewayError};
pub use concord::clients;
pub use concord::config::{self, EngineConfig};
pub use concord::consensus::{self, ConsensusEvaluator, ConsensusSnapshot, Recommendation};
pub use concord::event_bus::{self, DiscussionEvent, EventBus, Subscription};
pub use concord::orchestrator::{self, DiscussionOrchestrator};
pub use concord::roles::{self, RoleDefinition, RoleSynthesizer};
