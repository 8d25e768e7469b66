pub mod position;
pub mod quote;
pub mod signal;
