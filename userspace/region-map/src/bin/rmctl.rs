// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Command-line entry point for inspecting region-map configurations.

fn main() {
    env_logger::init();
    nexus_region_map::run();
}
