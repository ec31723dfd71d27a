//! `foreman audit`: read the governance log straight from disk.

use console::style;

use foreman_config::FabricConfig;
use foreman_core::{FabricError, Result, Severity};
use foreman_fabric::resolve_db_path;
use foreman_memory::{AuditCategory, AuditEvent, AuditFilter, AuditLog};

use super::truncate_output;

pub(super) struct AuditQuery {
    pub limit: usize,
    pub category: Option<String>,
    pub event_type: Option<String>,
    pub entry: Option<String>,
}

impl AuditQuery {
    fn into_filter(self) -> Result<AuditFilter> {
        let category = self
            .category
            .as_deref()
            .map(str::parse::<AuditCategory>)
            .transpose()?;
        Ok(AuditFilter {
            category,
            event_type: self.event_type,
            entry_id: self.entry,
            limit: Some(self.limit),
            ..AuditFilter::default()
        })
    }
}

fn open_log(config: &FabricConfig) -> Result<AuditLog> {
    if config.storage.is_in_memory() {
        return Err(FabricError::Config(
            "storage.db_path is ':memory:', there is no audit log on disk to read".into(),
        ));
    }
    let path = resolve_db_path(&config.storage.db_path);
    if !path.exists() {
        return Err(FabricError::Config(format!(
            "no audit log at {} (has the fabric run yet?)",
            path.display()
        )));
    }
    AuditLog::open(&path)
}

pub(super) fn cmd_audit(config: &FabricConfig, query: AuditQuery, json: bool) -> Result<()> {
    let log = open_log(config)?;
    let events = log.query(&query.into_filter()?)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("  No audit events match.");
        return Ok(());
    }
    for event in &events {
        print_event(event);
    }
    println!();
    println!("  {} of {} events shown", events.len(), log.len()?);
    Ok(())
}

pub(super) fn cmd_verify(config: &FabricConfig) -> Result<()> {
    let log = open_log(config)?;
    let report = log.verify_chain()?;
    match report.broken_at {
        None => {
            println!(
                "  {} checksum chain intact ({} events verified)",
                style("✓").green(),
                report.verified
            );
            Ok(())
        }
        Some(seq) => {
            println!(
                "  {} checksum chain broken at seq {seq} ({} events verified before it)",
                style("✗").red().bold(),
                report.verified
            );
            Err(FabricError::Storage(format!(
                "audit log checksum chain broken at seq {seq}"
            )))
        }
    }
}

fn print_event(event: &AuditEvent) {
    let severity = match event.severity {
        Severity::Critical => style(event.severity.to_string()).red().bold(),
        Severity::High => style(event.severity.to_string()).red(),
        Severity::Medium => style(event.severity.to_string()).yellow(),
        Severity::Low => style(event.severity.to_string()).dim(),
    };
    println!(
        "  {:>5} {} {:<8} {:<18} {:<32} {}",
        event.seq,
        style(event.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
        severity,
        event.category.to_string(),
        event.event_type,
        truncate_output(&event.description, 80)
    );
    if let Some(id) = &event.entry_id {
        println!("        {} {id}", style("entry").dim());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_category_is_rejected() {
        let query = AuditQuery {
            limit: 10,
            category: Some("nonsense".into()),
            event_type: None,
            entry: None,
        };
        assert!(query.into_filter().is_err());
    }

    #[test]
    fn query_maps_onto_filter() {
        let query = AuditQuery {
            limit: 3,
            category: Some("arc_decision".into()),
            event_type: Some("ltm_deletion_approved".into()),
            entry: Some("ltm_1".into()),
        };
        let filter = query.into_filter().unwrap();
        assert_eq!(filter.category, Some(AuditCategory::ArcDecision));
        assert_eq!(filter.event_type.as_deref(), Some("ltm_deletion_approved"));
        assert_eq!(filter.entry_id.as_deref(), Some("ltm_1"));
        assert_eq!(filter.limit, Some(3));
    }

    #[test]
    fn in_memory_storage_has_nothing_to_read() {
        let mut config = FabricConfig::default();
        config.storage.db_path = ":memory:".into();
        assert!(open_log(&config).is_err());
    }
}
