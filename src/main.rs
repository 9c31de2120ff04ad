use std::sync::Arc;

use tracing::{error, info};

use mapstate::{Config, StateHandle, StateRegistry, GLOBAL_MAP_ID};

/// Maps brought up by the demo host.
const DEMO_MAPS: [u32; 3] = [0, 1, 530];

/// Ticks run before shutting down.
const DEMO_TICKS: usize = 3;

fn main() {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            Config::default()
        }
    };

    // Initialize logging
    if let Err(e) = mapstate::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        mapstate::logging::init_console_only(&config.logging.level);
    }

    if !config.engine.enabled {
        info!("Lua engine disabled in configuration");
        return;
    }

    let registry = match StateRegistry::load(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to load scripts: {}", e);
            return;
        }
    };
    info!(
        scripts = registry.scripts().len(),
        path = %config.engine.script_path,
        "mapstate starting"
    );

    let mut handles = Vec::new();
    for map_id in std::iter::once(GLOBAL_MAP_ID).chain(DEMO_MAPS) {
        match StateHandle::attach(&registry, map_id, 0) {
            Ok(handle) => handles.push(handle),
            Err(e) => error!(map = map_id, "Failed to create state: {}", e),
        }
    }
    info!(states = registry.len(), "states ready");

    for tick in 0..DEMO_TICKS {
        let delivered = registry.update_all();
        info!(tick, delivered, "update");
    }

    drop(handles);
    registry.shutdown();
}
