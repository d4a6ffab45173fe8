// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User-facing CLI helpers for inspecting region-map configurations.

use crate::config::Config;

/// Returns the CLI usage string for the region-map tool.
pub fn help() -> &'static str {
    "rmctl inspects region-map limits. Usage: rmctl [--help] [--config PATH]"
}

/// Executes the CLI using provided arguments.
pub fn execute(args: &[&str]) -> String {
    if args.iter().any(|arg| *arg == "--help") {
        return help().to_string();
    }
    let config = match args.iter().position(|arg| *arg == "--config") {
        Some(pos) => match args.get(pos + 1) {
            Some(path) => match Config::load(path) {
                Ok(config) => config,
                Err(err) => return format!("rmctl: {err}"),
            },
            None => return "rmctl: --config requires a path".to_string(),
        },
        None => Config::default(),
    };
    let limit = match config.max_map_size_log2 {
        Some(limit) => format!("{}", 1usize << limit),
        None => "unlimited".to_string(),
    };
    format!(
        "region map ready: max_regions={} page_size={} max_map_size={}",
        config.max_regions,
        config.page_size(),
        limit
    )
}

/// Parses `std::env::args` and prints the execution result.
pub fn run() {
    let owned: Vec<String> = std::env::args().skip(1).collect();
    let refs: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
    println!("{}", execute(&refs));
}

#[cfg(test)]
mod tests {
    use super::{execute, help};

    #[test]
    fn help_contains_name() {
        assert!(help().contains("rmctl"));
        assert_eq!(execute(&["--help"]), help());
    }

    #[test]
    fn exec_default() {
        let out = execute(&[]);
        assert!(out.contains("ready"));
        assert!(out.contains("max_regions=4096"));
        assert!(out.contains("page_size=4096"));
    }

    #[test]
    fn missing_config_path_reported() {
        assert!(execute(&["--config"]).contains("requires a path"));
    }
}
