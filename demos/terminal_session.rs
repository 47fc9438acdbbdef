use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};
use bleterm::{
    ConnectionParams, Direction, Encoding, LineEnding, Result, TerminalDevice, TerminalEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💬 bleterm Terminal Session Example");
    info!("Searching for terminal peripherals...");

    let terminal = match TerminalDevice::connect_first(ConnectionParams::default()).await {
        Ok(device) => {
            info!("✅ Connected to: {}", device.device().identity);
            device
        }
        Err(e) => {
            error!("❌ Failed to connect to device: {}", e);
            return Err(e);
        }
    };

    // Print events as they arrive
    let mut events = terminal.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TerminalEvent::TxFinished { text } => info!("📤 Sent: {}", text),
                TerminalEvent::TxError { reason } => warn!("⚠️  Send failed: {}", reason),
                TerminalEvent::BatteryLevel(level) => info!("🔋 Battery: {}%", level),
                TerminalEvent::Disconnected => {
                    info!("🔌 Disconnected");
                    break;
                }
                _ => {}
            }
        }
    });

    terminal.set_line_ending(LineEnding::CrLf).await;
    terminal.send("hello").await?;
    sleep(Duration::from_secs(1)).await;

    terminal.set_encoding(Encoding::Hex).await;
    terminal.send("01 02 03 FF").await?;
    sleep(Duration::from_secs(1)).await;

    // Invalid hex is rejected before anything is written
    if let Err(e) = terminal.send("0G").await {
        info!("🚫 Rejected as expected: {}", e);
    }

    if let Some(level) = terminal.battery_level().await {
        info!("🔋 Last battery level: {}%", level);
    }

    println!("\n📜 Message log");
    for entry in terminal.log_snapshot().await {
        let tag = match entry.direction {
            Direction::Received => "RX",
            Direction::Transmitted => "TX",
            Direction::BatteryNotice => "BAT",
        };
        println!("  {tag:>3} | {}", entry.text.trim_end());
    }

    terminal.disconnect().await?;
    let _ = printer.await;

    info!("✅ Example completed successfully");
    Ok(())
}
