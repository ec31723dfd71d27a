//! `foreman privileges` and `foreman status`.

use console::style;
use serde_json::json;

use foreman_boundary::matrix;
use foreman_config::FabricConfig;
use foreman_core::{Embodiment, Result, Tier};
use foreman_fabric::MemoryFabric;
use foreman_sync::HealthStatus;

pub(super) fn cmd_privileges(json: bool) -> Result<()> {
    let rows = matrix();

    if json {
        let table: serde_json::Map<String, serde_json::Value> = rows
            .iter()
            .map(|(embodiment, access)| {
                let tiers: serde_json::Map<String, serde_json::Value> = Tier::ALL
                    .iter()
                    .zip(access)
                    .map(|(tier, a)| (tier.id_prefix().to_string(), json!(a.to_string())))
                    .collect();
                (embodiment.to_string(), tiers.into())
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    print!("  {:<20}", "");
    for tier in Tier::ALL {
        print!("{:>6}", tier.id_prefix().to_uppercase());
    }
    println!();
    for (embodiment, access) in rows {
        print!("  {:<20}", embodiment.to_string());
        for a in access {
            let cell = format!("{:>6}", a.to_string());
            if a.write {
                print!("{}", style(cell).green());
            } else if a.read {
                print!("{}", style(cell).cyan());
            } else {
                print!("{}", style(cell).dim());
            }
        }
        println!();
    }
    println!();
    println!("  {}", style("Governance \"w\" means append only; only isms_runtime touches LTM.").dim());
    Ok(())
}

pub(super) async fn cmd_status(
    config: FabricConfig,
    only: Option<Embodiment>,
    json: bool,
) -> Result<()> {
    let fabric = MemoryFabric::new(config)?;

    let mut instances = Vec::new();
    for instance in fabric.instances() {
        if only.is_some_and(|e| e != instance.embodiment()) {
            continue;
        }
        let mut counts = serde_json::Map::new();
        for tier in Tier::ALL {
            // LTM rows are counted under the instance's own tenant only.
            let tenant = if tier.is_tenant_scoped() { instance.tenant() } else { None };
            if tier.is_tenant_scoped() && tenant.is_none() {
                continue;
            }
            let n = instance.store().count_active(tier, tenant)?;
            counts.insert(tier.id_prefix().to_string(), json!(n));
        }
        instances.push(json!({
            "id": instance.id(),
            "embodiment": instance.embodiment(),
            "tenant": instance.tenant(),
            "entries": counts,
        }));
    }

    let embodiments: Vec<Embodiment> = Embodiment::ALL
        .into_iter()
        .filter(|e| only.is_none_or(|o| o == *e))
        .filter(|e| fabric.instances().iter().any(|i| i.embodiment() == *e))
        .collect();
    let sync: Vec<_> = embodiments
        .iter()
        .map(|e| fabric.get_sync_status(*e))
        .collect();

    if json {
        let chain = fabric.audit().verify_chain()?;
        let out = json!({
            "instances": instances,
            "sync": sync,
            "audit": { "events": fabric.audit().len()?, "chainIntact": chain.is_intact() },
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("🧠 {}", style("Foreman Memory Fabric").bold());
    println!();
    println!("  {}", style("Instances").bold());
    for inst in &instances {
        let entries = inst["entries"]
            .as_object()
            .map(|m| {
                m.iter()
                    .map(|(tier, n)| format!("{tier}={n}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        println!(
            "    {:<28} {}",
            inst["id"].as_str().unwrap_or_default(),
            style(entries).dim()
        );
    }

    println!();
    println!("  {}", style("Sync").bold());
    for status in &sync {
        let health = match status.health_status {
            HealthStatus::Healthy => style(status.health_status.as_str()).green(),
            HealthStatus::Degraded => style(status.health_status.as_str()).yellow(),
            HealthStatus::OutOfSync => style(status.health_status.as_str()).red(),
        };
        let last = status
            .last_sync_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "    {:<20} {:<12} pending={:<4} conflicts={:<3} last={}",
            status.embodiment.to_string(),
            health,
            status.pending_updates,
            status.conflicts.len(),
            last
        );
    }

    let chain = fabric.audit().verify_chain()?;
    println!();
    println!(
        "  {} {} events, chain {}",
        style("Audit").bold(),
        fabric.audit().len()?,
        if chain.is_intact() {
            style("intact").green()
        } else {
            style("BROKEN").red().bold()
        }
    );
    Ok(())
}
