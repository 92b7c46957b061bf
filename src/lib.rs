pub mod api;
pub mod config;
pub mod events;
pub mod gate;
pub mod image_tasks;
pub mod research_store;
pub mod session;
pub mod supervisor;
pub mod timeline;
pub mod transcript;

pub use api::{ApiClient, AspectRatio, EffortLevel};
pub use config::ClientConfig;
pub use events::{classify, EventTitle, ProcessedEvent};
pub use session::{ClientUpdate, SessionCoordinator};
pub use transcript::{merge_transcript, Message, MessageKind, MessageRole};
