use serde_derive::{Deserialize, Serialize};

/// CLI configuration: the engine options plus front-end knobs. Loaded with
/// confy; a missing file is created with defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// Log level for the rolling file log.
    pub log_level: String,

    /// The embedded engine configuration.
    pub engine: aifs::config::Config,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 1,
            log_level: "info".to_string(),
            engine: aifs::config::Config::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_confy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("aifs.toml");

        let loaded: ConfigLoad = confy::load_path(&path).expect("load creates defaults");
        assert_eq!(loaded.log_level, "info");
        assert_eq!(loaded.engine.compression_level, 1);

        let mut changed = loaded;
        changed.engine.embedding_dim = 64;
        confy::store_path(&path, &changed).expect("store");
        let reloaded: ConfigLoad = confy::load_path(&path).expect("reload");
        assert_eq!(reloaded.engine.embedding_dim, 64);
    }
}
