#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use foreman_config::ConfigLoader;
    use foreman_config::schema::*;
    use foreman_core::Embodiment;
    use std::io::Write;

    fn key(byte: u8) -> String {
        BASE64.encode([byte; 32])
    }

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_tier_config_defaults() {
        let config = TierConfig::default();
        assert_eq!(config.stm_max_entries, 1000);
        assert_eq!(config.wm_max_entries, 10000);
        assert_eq!(config.ltm_archive_threshold, 100000);
        assert_eq!(config.stm_ttl_secs, 86400);
    }

    #[test]
    fn test_sync_and_boundary_defaults() {
        let config = FabricConfig::default();
        assert_eq!(config.sync.delivery_timeout_ms, 2000);
        assert!(config.boundary.detect_cross_tenant_references);
        assert_eq!(config.boundary.entropy_threshold, 3.5);
        assert!(config.boundary.protected_paths.is_empty());
        assert!(config.arc.signing_key.is_none());
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_default_config_is_valid_with_arc_warning() {
        let warnings = FabricConfig::default().validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "arc.signing_key"));
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }

    #[test]
    fn test_effective_instances_default_one_per_embodiment() {
        let instances = FabricConfig::default().effective_instances();
        assert_eq!(instances.len(), Embodiment::ALL.len());
        assert!(instances.iter().all(|i| i.tenant.is_none()));
    }

    // ── Working sets ───────────────────────────────────────────

    #[test]
    fn test_default_working_sets() {
        let sync = SyncConfig::default();
        let set = sync.working_set(Embodiment::Foreman);
        assert!(set.contains(&Embodiment::ForemanApp));
        assert!(set.contains(&Embodiment::LocalBuilder));
        assert!(!set.contains(&Embodiment::IsmsRuntime));
        assert!(!set.contains(&Embodiment::Foreman));
        assert!(sync.working_set(Embodiment::MarketingMaturion).is_empty());
    }

    #[test]
    fn test_working_set_membership_is_symmetric() {
        let toml_str = r#"
[sync.working_sets]
marketing_maturion = ["command_maturion"]
"#;
        let config: FabricConfig = toml::from_str(toml_str).unwrap();
        assert!(
            config
                .sync
                .working_set(Embodiment::CommandMaturion)
                .contains(&Embodiment::MarketingMaturion)
        );
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = FabricConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: FabricConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.tiers.wm_max_entries, config.tiers.wm_max_entries);
        assert_eq!(restored.sync.working_sets, config.sync.working_sets);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[tiers]
stm_max_entries = 50

[storage]
db_path = ":memory:"
"#;
        let config: FabricConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tiers.stm_max_entries, 50);
        assert_eq!(config.tiers.wm_max_entries, 10000);
        assert!(config.storage.is_in_memory());
        assert_eq!(config.sync.delivery_timeout_ms, 2000);
    }

    #[test]
    fn test_instances_deserialize() {
        let toml_str = r#"
[[instances]]
embodiment = "isms_runtime"
tenant = "tenant_a"

[[instances]]
embodiment = "foreman"
id = "orchestrator-1"
"#;
        let config: FabricConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.instances[0].instance_id(), "isms_runtime@tenant_a");
        assert_eq!(config.instances[1].instance_id(), "orchestrator-1");
        assert_eq!(config.effective_instances().len(), 2);
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_zero_limits_are_errors() {
        let mut config = FabricConfig::default();
        config.tiers.stm_max_entries = 0;
        config.sync.delivery_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("tiers.stm_max_entries"));
        assert!(err.contains("sync.delivery_timeout_ms"));
    }

    #[test]
    fn test_short_tenant_key_is_error() {
        let mut config = FabricConfig::default();
        config
            .encryption
            .tenant_keys
            .insert("tenant_a".into(), BASE64.encode([1u8; 16]));
        let err = config.validate().unwrap_err();
        assert!(err.contains("encryption.tenant_keys.tenant_a"));
    }

    #[test]
    fn test_valid_keys_pass() {
        let mut config = FabricConfig::default();
        config.encryption.tenant_keys.insert("tenant_a".into(), key(1));
        config.arc.signing_key = Some(key(2));
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().all(|w| !w.field.starts_with("encryption")));
        assert!(warnings.iter().all(|w| w.field != "arc.signing_key"));
    }

    #[test]
    fn test_unknown_working_set_key_is_error() {
        let mut config = FabricConfig::default();
        config
            .sync
            .working_sets
            .insert("dashboard".into(), vec![Embodiment::Foreman]);
        assert!(config.validate().unwrap_err().contains("dashboard"));
    }

    #[test]
    fn test_entropy_threshold_range() {
        let mut config = FabricConfig::default();
        config.boundary.entropy_threshold = 0.0;
        assert!(config.validate().is_err());
        config.boundary.entropy_threshold = 9.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_instances_are_error() {
        let mut config = FabricConfig::default();
        config.instances = vec![
            InstanceConfig::for_tenant(Embodiment::IsmsRuntime, "t1"),
            InstanceConfig::for_tenant(Embodiment::IsmsRuntime, "t1"),
        ];
        assert!(config.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_unknown_log_format_is_warning() {
        let mut config = FabricConfig::default();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        let w = warnings.iter().find(|w| w.field == "logging.format").unwrap();
        assert_eq!(w.severity, WarningSeverity::Warning);
        assert!(w.to_string().contains("xml"));
    }

    #[test]
    fn test_redacted_hides_key_material() {
        let mut config = FabricConfig::default();
        config.encryption.tenant_keys.insert("tenant_a".into(), key(3));
        config.arc.signing_key = Some(key(4));
        let shown = config.redacted();
        assert_eq!(shown.encryption.tenant_keys["tenant_a"], "[redacted]");
        assert_eq!(shown.arc.signing_key.as_deref(), Some("[redacted]"));
        assert_eq!(config.encryption.tenant_keys["tenant_a"], key(3));
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fabric.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[tiers]
wm_max_entries = 200

[sync]
delivery_timeout_ms = 500

[boundary]
protected_paths = ["docs/charter.md"]
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.tiers.wm_max_entries, 200);
        assert_eq!(config.boundary.protected_paths, vec!["docs/charter.md"]);
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::load(Some(dir.path().join("absent.toml").as_path())).unwrap();
        assert_eq!(loader.get().tiers.stm_max_entries, 1000);
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fabric.toml");
        std::fs::write(&config_path, "[tiers]\nltm_archive_threshold = 0\n").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fabric.toml");
        std::fs::write(&config_path, "[tiers]\nstm_max_entries = 10\n").unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().tiers.stm_max_entries, 10);

        std::fs::write(&config_path, "[tiers]\nstm_max_entries = 20\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().tiers.stm_max_entries, 20);
    }

    #[test]
    fn test_reload_with_broken_file_keeps_current_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("fabric.toml");
        std::fs::write(&config_path, "[tiers]\nstm_max_entries = 10\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();

        std::fs::write(&config_path, "[tiers\nstm_max_entries = ").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().tiers.stm_max_entries, 10);

        std::fs::write(&config_path, "[tiers]\nstm_max_entries = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().tiers.stm_max_entries, 10);
    }

    #[test]
    fn test_from_config_validates() {
        let mut config = FabricConfig::default();
        assert!(ConfigLoader::from_config(config.clone()).is_ok());
        config.tiers.wm_max_entries = 0;
        assert!(ConfigLoader::from_config(config).is_err());
    }

    // ── JSON roundtrip ─────────────────────────────────────────

    #[test]
    fn test_config_json_roundtrip() {
        let config = FabricConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: FabricConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.tiers.stm_ttl_secs, config.tiers.stm_ttl_secs);
    }
}
