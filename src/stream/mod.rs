pub mod dispatcher;
pub mod jpeg;
pub mod multipart;
pub mod server;

pub use dispatcher::Dispatcher;
pub use jpeg::RepairedFrame;
pub use server::{Connections, StreamServer};
