use std::time::Duration;
use tracing::{error, info, warn};
use bleterm::{
    AdvertisementClassifier, BeaconData, BleManager, ConnectionParams, DeviceRegistry, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📡 bleterm Beacon Scanner Example");

    let params = ConnectionParams::default();
    let manager = match BleManager::new().await {
        Ok(manager) => manager,
        Err(e) => {
            error!("❌ No Bluetooth adapter available: {}", e);
            return Err(e);
        }
    };

    let mut registry = DeviceRegistry::new(AdvertisementClassifier::new(params.company_id));

    // Three scan rounds; beacons persist across rounds, devices do not
    for round in 1..=3 {
        info!("🔍 Scan round {}...", round);
        manager
            .scan(Duration::from_millis(params.scan_timeout_ms), &mut registry)
            .await?;

        println!("\n📶 Connectable devices");
        for device in registry.devices() {
            println!("  {} {:>4} dBm", device.identity, device.rssi);
        }

        println!("\n🏷️  Beacons");
        for beacon in registry.beacons() {
            println!("  {} [{}] {:>4} dBm", beacon.identity, beacon.class, beacon.rssi);
            match beacon.decode() {
                Ok(BeaconData::Proximity(proximity)) => println!("    {proximity}"),
                Ok(BeaconData::Sensor(sensor)) => println!("    {sensor}"),
                Err(e) => warn!("⚠️  Could not decode {}: {}", beacon.identity, e),
            }
        }

        registry.end_scan();
    }

    info!("✅ Scanning finished");
    Ok(())
}
