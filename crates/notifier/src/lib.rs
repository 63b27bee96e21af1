pub mod emitter;
pub mod render;
pub mod worker;
