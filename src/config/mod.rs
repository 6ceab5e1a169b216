//! Configuration schema and loader.

mod load;
mod schema;

pub use load::{
    CONFIG_FILE_NAME, ConfigError, candidate_paths, find_config_file, load, load_default,
    parse_target_url, validate,
};
pub use schema::{
    Compression, Config, DurationSpec, Encryption, RetentionConfig, ScaledBytes, SnapshotSource,
    TargetConfig, VolumeConfig, parse_duration, parse_scaled_bytes,
};
