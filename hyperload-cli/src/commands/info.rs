//! Firmware info and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    hyperload::{BlockPlan, FirmwareImage, ImageFormat, auto_detect_port, device::detect_ports},
    std::path::Path,
};

/// Stable identifier of an image format for JSON output.
fn format_id(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::IntelHex => "intel-hex",
        ImageFormat::Binary => "binary",
    }
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for line in hyperload::format_port_list(&detected) {
        eprintln!("  {} {line}", style("\u{2022}").green());
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("\u{2192}").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, block_size: usize, json: bool) -> Result<()> {
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let format = image.format();
    let base_address = image.base_address();
    let size = image.len();

    let plan = BlockPlan::new(image.into_bytes(), block_size)
        .with_context(|| format!("Cannot lay out image in {block_size} byte blocks"))?;

    if json {
        let info = serde_json::json!({
            "file": firmware.display().to_string(),
            "format": format_id(format),
            "base_address": format!("0x{base_address:08X}"),
            "size": size,
            "block_size": block_size,
            "total_blocks": plan.total_blocks(),
            "padded_size": plan.padded_len(),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!("{}", style("Firmware image").bold().underlined());
    eprintln!("  File:         {}", firmware.display());
    eprintln!("  Format:       {format}");
    eprintln!("  Base address: 0x{base_address:08X}");
    eprintln!("  Size:         {size} bytes");
    eprintln!(
        "\n{}",
        style(format!("Layout in {block_size} byte blocks"))
            .bold()
            .underlined()
    );
    eprintln!("  Blocks:       {}", plan.total_blocks());
    eprintln!(
        "  Padded size:  {} bytes ({} padding)",
        plan.padded_len(),
        plan.padded_len() - size
    );

    Ok(())
}
