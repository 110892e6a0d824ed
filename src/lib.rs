pub mod backends;
pub mod config;
pub mod encoder;
pub mod error;
pub mod index;
pub mod logging;
pub mod prompts;
pub mod retrieval;
pub mod textutil;
pub mod trace;
pub mod translator;

pub use backends::{BackendDispatcher, BackendId};
pub use config::Settings;
pub use translator::{AssistMode, TranslationContext, TranslationResult, Translator};
