use anyhow::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_LISTEN: &str = "/run/location.sock";
pub const DEFAULT_MONGO_URL: &str = "mongodb://localhost:27017";
pub const DEFAULT_DATABASE: &str = "memory";

/// Order of the coordinate pair emitted by the obfuscation transform.
/// Consumers disagree on which convention they expect, so it is
/// configuration rather than a hardcoded choice.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateOrder {
    LonLat,
    LatLon,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// TCP port if the value parses as an integer, unix socket path otherwise.
    pub listen: String,
    pub mongo_url: String,
    pub database: String,
    /// Maximum obfuscation displacement in meters.
    pub radius_m: f64,
    /// Grid step in degrees for coordinate snapping; 0 disables snapping.
    pub grid_step: f64,
    pub coordinate_order: CoordinateOrder,
    /// Per-observer broadcast buffer; observers lagging past this are dropped.
    pub bus_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            mongo_url: DEFAULT_MONGO_URL.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            radius_m: 555.0,
            grid_step: 0.05,
            coordinate_order: CoordinateOrder::LonLat,
            bus_capacity: 64,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("listen", DEFAULT_LISTEN)?
            .set_default("mongo_url", DEFAULT_MONGO_URL)?
            .set_default("database", DEFAULT_DATABASE)?
            .set_default("radius_m", 555.0)?
            .set_default("grid_step", 0.05)?
            .set_default("coordinate_order", "lonlat")?
            .set_default("bus_capacity", 64)?;

        let config_path = PathBuf::from("config.toml");
        if config_path.exists() {
            builder = builder.add_source(File::from(config_path));
        }

        builder = builder.add_source(Environment::with_prefix("MEMORY"));

        let config = builder.build()?;
        let mut app_config: AppConfig = config.try_deserialize()?;

        // PORT and MONGO_URL are what existing deployments already set;
        // they take precedence over everything else.
        if let Ok(listen) = std::env::var("PORT") {
            app_config.listen = listen;
        }
        if let Ok(url) = std::env::var("MONGO_URL") {
            app_config.mongo_url = url;
        }

        Ok(app_config)
    }

    /// Grid step with the 0-disables convention resolved.
    pub fn snap_step(&self) -> Option<f64> {
        (self.grid_step > 0.0).then_some(self.grid_step)
    }
}
