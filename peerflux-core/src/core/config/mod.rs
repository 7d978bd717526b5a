pub use encoding_settings::*;
pub use settings::*;
pub use window_settings::*;

mod encoding_settings;
mod settings;
mod window_settings;
