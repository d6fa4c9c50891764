pub mod buffer;
pub mod catalog;
pub mod channels;
pub mod config;
pub mod intent;
pub mod llm;
pub mod orchestrator;
pub mod reassembler;
pub mod runtime;
pub mod session;
pub mod web;

pub use shopchat_app::logging;
pub use shopchat_channels::channel;
pub use shopchat_channels::channel_adapter;
pub use shopchat_channels::dedup;
pub use shopchat_core::error;
pub use shopchat_core::llm_types;
pub use shopchat_core::text;
pub use shopchat_storage as storage;
