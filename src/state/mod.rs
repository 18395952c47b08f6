pub mod config_manager;
pub mod device_cache;
