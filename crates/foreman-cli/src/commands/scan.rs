//! `foreman scan`: run the secret detectors over a JSON payload before storing it.

use std::io::Read;
use std::path::Path;

use console::style;

use foreman_boundary::{ScanResult, SecretScanner};
use foreman_config::FabricConfig;
use foreman_core::{FabricError, Result};

fn read_payload(file: &Path) -> Result<serde_json::Value> {
    let raw = if file.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(file)?
    };
    // Plain text is scanned as a single string value.
    Ok(serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)))
}

pub(super) fn scan_payload(config: &FabricConfig, payload: &serde_json::Value) -> ScanResult {
    SecretScanner::new(config.boundary.entropy_threshold).scan(payload)
}

pub(super) fn cmd_scan(config: &FabricConfig, file: &Path, json: bool) -> Result<()> {
    let payload = read_payload(file)?;
    let result = scan_payload(config, &payload);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.clean {
        println!("  {} no secrets found", style("✓").green());
    } else {
        for m in &result.matches {
            println!(
                "  {} {:<22} {:<32} {}",
                style("✗").red(),
                m.kind.as_str(),
                m.pointer,
                style(&m.preview).dim()
            );
        }
    }

    if result.clean {
        Ok(())
    } else {
        Err(FabricError::SecretDetected {
            count: result.secrets_detected,
        })
    }
}
