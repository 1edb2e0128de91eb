/// Default HTTP bind address
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8000;

/// Config file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "senserecord.yml";

/// Directory under the user config dir
pub const CONFIG_DIR_NAME: &str = "senserecord";

/// Config file name inside [`CONFIG_DIR_NAME`]
pub const USER_CONFIG_FILE: &str = "config.yml";
