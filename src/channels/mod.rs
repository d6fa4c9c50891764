pub mod line;
pub mod messenger;
pub mod signature;

pub use line::LineAdapter;
pub use messenger::MessengerAdapter;
