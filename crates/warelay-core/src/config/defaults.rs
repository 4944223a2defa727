//! Default value functions used by serde for config deserialization.

pub fn default_data_dir() -> String {
    "~/.warelay".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_port() -> u16 {
    8000
}

pub fn default_max_instances() -> usize {
    1
}

pub fn default_init_timeout() -> u64 {
    120
}

pub fn default_send_timeout() -> u64 {
    60
}

pub fn default_logout_timeout() -> u64 {
    30
}

pub fn default_device_name() -> String {
    "warelay".to_string()
}

pub fn default_identity() -> String {
    "default".to_string()
}
