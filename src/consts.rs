pub const DOMAIN: &str = "tuya_local";

pub const CONF_DEVICE_ID: &str = "device_id";
pub const CONF_LOCAL_KEY: &str = "local_key";
pub const CONF_HOST: &str = "host";
pub const CONF_NAME: &str = "name";
pub const CONF_TYPE: &str = "type";
pub const CONF_POLL_ONLY: &str = "poll_only";
pub const CONF_IS_GATEWAY: &str = "is_gateway";
pub const CONF_DEVICE_CID: &str = "device_cid";
pub const CONF_PARENT_GATEWAY: &str = "parent_gateway";
pub const CONF_PROTOCOL_VERSION: &str = "protocol_version";

/// Protocol versions the local API speaks, in the order they are tried.
pub const API_PROTOCOL_VERSIONS: [&str; 5] = ["3.3", "3.1", "3.2", "3.4", "3.5"];

pub const DEFAULT_PROTOCOL_VERSION: &str = "3.3";
