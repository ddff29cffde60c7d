mod loader;
mod root;

pub use loader::{load_from_path, load_legacy_str};
pub use root::Config;
