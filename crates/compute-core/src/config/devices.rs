use std::collections::HashSet;
use std::path::Path;

use anyhow::Context as _;

use crate::devices::DeviceSpec;

/// Inventory used when no devices file is given.
pub fn default_inventory() -> Vec<DeviceSpec> {
    vec![DeviceSpec {
        id: 0,
        name: "Simulated GPU 0".to_string(),
        memory_mb: 8192,
    }]
}

/// load the device inventory from a YAML list
pub async fn load_devices(path: Option<&Path>) -> anyhow::Result<Vec<DeviceSpec>> {
    let Some(path) = path else {
        tracing::info!("No devices file given, using the default inventory");
        return Ok(default_inventory());
    };
    tracing::info!("Loading device inventory from {:?}", path);

    let yaml_content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let devices = parse_devices(&yaml_content)?;

    tracing::info!("Loaded {} device(s)", devices.len());
    Ok(devices)
}

pub fn parse_devices(yaml: &str) -> anyhow::Result<Vec<DeviceSpec>> {
    let devices: Vec<DeviceSpec> = serde_yaml::from_str(yaml).context("invalid device inventory")?;

    let mut seen = HashSet::new();
    for device in &devices {
        anyhow::ensure!(
            seen.insert(device.id),
            "device id {} is listed more than once",
            device.id
        );
        anyhow::ensure!(
            device.memory_mb > 0,
            "device {} ({}) has no memory",
            device.id,
            device.name
        );
    }
    Ok(devices)
}
