pub const APP_NAME: &str = "Wireflow";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
