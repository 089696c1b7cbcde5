pub mod backend;
pub mod config;
pub mod error;
pub mod generation;

pub use config::AtelierConfig;
pub use error::{Error, Result};
pub use generation::{
    GenerationMode, GenerationParams, GenerationSession, ModeState, SchedulerCatalog,
};
