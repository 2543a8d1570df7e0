pub mod acquire;

pub use acquire::{load_config_default, load_config_from, AcquireConfig, Credentials, TapConfig};
