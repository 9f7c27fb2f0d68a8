//! Network protocol parsing.

pub mod packet;
