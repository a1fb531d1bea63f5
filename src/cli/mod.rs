//! Command-line front-end

pub mod commands;

pub use commands::{
    cmd_header_hash, cmd_headers, cmd_info, cmd_peers, cmd_start, node_config, CliResult,
    StartOptions, DEFAULT_DATA_DIR,
};
