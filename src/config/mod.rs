/// Configuration system
///
/// - `macros`: `config_struct!` for single-declaration sections with defaults
/// - `schemas`: every section and the root `Config`
/// - `utils`: loading, reloading, global access
#[macro_use]
pub mod macros;
pub mod schemas;
pub mod utils;

pub use schemas::*;
pub use utils::{
    get_config_clone, load_config, load_config_from_path, parse_config, read_config_file,
    reload_config_from_path, unknown_keys, with_config, CONFIG_FILE_PATH,
};
