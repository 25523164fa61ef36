#![warn(missing_docs)]

//! Gatewire gateway subsystem: shard connections, heartbeats, identify pacing, shard orchestration
//!
//! Shard lifecycle: Connect → HELLO → Identify or Resume → Dispatch loop → Reconnect or Close

pub mod close;
pub mod config;
pub mod discovery;
pub mod error;
pub mod heartbeat;
pub mod identify;
pub mod orchestrator;
pub mod protocol;
pub mod shard;
pub mod signals;
pub mod state;
pub mod transport;

pub use close::CloseCode;
pub use config::{ClientConfig, GatewayConfig};
pub use discovery::{GatewayBot, SessionStartLimit};
pub use error::{is_retryable, GatewayError, Result};
pub use heartbeat::{HeartbeatAction, HeartbeatState, HeartbeatStats, HeartbeatTracker};
pub use identify::{IdentifyGate, IdentifyPermit};
pub use orchestrator::{Phase, ShardEvents, ShardOrchestrator};
pub use protocol::{GatewayEvent, GatewayFrame, Hello, Identify, Opcode, Ready};
pub use shard::{ResumeData, ShardConnection, ShardHandle, ShardTermination};
pub use signals::{run_until, run_until_interrupted, wait_for_interrupt};
pub use state::{ShardState, ShardStatus, StatusPublisher};
pub use transport::{GatewaySocket, GatewayTransport, SocketMessage, WsTransport};
