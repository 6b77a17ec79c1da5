use std::path::{Path, PathBuf};

use eyre::OptionExt;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use springcard_ccid::{SecureChannelConfig, SessionConfig};

/// Settings read from `~/.springcard/ccid.toml` and `CCID_*` variables
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    /// Serial number or name fragment of the reader to open
    pub reader: Option<String>,
    #[serde(flatten)]
    pub session: SessionConfig,
}

/// Returns the base config directory for the ccid tool
pub fn config_dir() -> eyre::Result<PathBuf> {
    #[allow(deprecated)]
    let home = std::env::home_dir().ok_or_eyre("home directory not found")?;
    Ok(home.join(".springcard"))
}

/// Load the configuration file, `CCID_` environment variables win over it
pub fn load_config(path: Option<&Path>) -> eyre::Result<Config> {
    let file = match path {
        Some(path) => path.to_path_buf(),
        None => config_dir()?.join("ccid.toml"),
    };
    Ok(Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("CCID_").split("__"))
        .extract()?)
}

/// Parse a 32 character hex key
pub fn parse_key(key: &str, key_index: u8) -> eyre::Result<SecureChannelConfig> {
    let mut raw = [0u8; 16];
    hex::decode_to_slice(key.trim(), &mut raw)
        .map_err(|e| eyre::eyre!("invalid secure channel key: {e}"))?;
    Ok(SecureChannelConfig::new(raw, key_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_load_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ccid.toml",
                r#"
                reader = "Puck"
                auto_connect = false
                connect_timeout = 2000

                [secure_channel]
                key = "000102030405060708090a0b0c0d0e0f"
                key_index = 2
                "#,
            )?;
            jail.set_env("CCID_READ_DEVICE_INFO", "false");

            let config = load_config(Some(Path::new("ccid.toml"))).expect("config");
            assert_eq!(config.reader.as_deref(), Some("Puck"));
            assert!(!config.session.auto_connect);
            assert!(!config.session.read_device_info);
            assert_eq!(config.session.connect_timeout.as_millis(), 2000);
            let secure = config.session.secure_channel.expect("secure channel");
            assert_eq!(secure.key_index, 2);
            assert_eq!(secure.key[15], 0x0F);
            Ok(())
        });
    }

    #[test]
    fn test_parse_key() {
        let secure = parse_key("E7AEAA9C5E5B0E1C3E0F8D7A29B9D5C1", 1).unwrap();
        assert_eq!(secure.key[0], 0xE7);
        assert!(parse_key("E7AE", 1).is_err());
    }
}
