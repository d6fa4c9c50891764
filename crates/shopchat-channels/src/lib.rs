pub mod channel;
pub mod channel_adapter;
pub mod dedup;
