// Generation session core: modes, scheduler resolution, prompt encoding and request assembly

pub mod encoding;
pub mod metadata;
pub mod mode;
pub mod notify;
pub mod prompt;
pub mod request;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;

pub use encoding::{encode, EncodingResult, PooledTextEncoder, TextConditioner, TextEncoder};
pub use metadata::GenerationMetadata;
pub use mode::{HistoryEntry, ModeState, Transition};
pub use notify::{Notification, Notifier, TracingNotifier};
pub use prompt::{parse_prompt_weights, PromptPiece};
pub use request::{InferenceRequest, RequestSnapshot};
pub use runtime::{FailureKind, InferenceFailure, InferenceOutput, InferenceRuntime};
pub use scheduler::{SchedulerAlgorithm, SchedulerCatalog, SchedulerSpec};
pub use session::GenerationSession;
pub use store::{DiskImageStore, ImageStore, SavedImage};
pub use types::{GenerationMode, GenerationParams, ModelArchitecture, DEFAULT_STRENGTH};
