pub use codec_cache::*;
pub use health::*;
pub use manager::*;
pub use remux::*;

mod codec_cache;
mod health;
mod manager;
mod remux;
