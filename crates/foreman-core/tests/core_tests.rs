#[cfg(test)]
mod tests {
    use foreman_core::*;
    use serde_json::json;

    fn ltm_entry() -> MemoryEntry {
        MemoryEntry::new(
            Tier::Ltm,
            Embodiment::IsmsRuntime,
            "risk_register",
            "isms",
            MemoryContent::new("risk", json!({"risk": "supplier outage"}))
                .with_sensitivity(Sensitivity::High),
        )
        .with_tenant("tenant_a")
    }

    // ── Tier tests ─────────────────────────────────────────────

    #[test]
    fn test_tier_wire_names() {
        assert_eq!(serde_json::to_string(&Tier::Stm).unwrap(), "\"STM\"");
        assert_eq!(serde_json::to_string(&Tier::Ltm).unwrap(), "\"LTM\"");
        assert_eq!(
            serde_json::to_string(&Tier::Governance).unwrap(),
            "\"Governance Memory\""
        );
        let back: Tier = serde_json::from_str("\"Governance Memory\"").unwrap();
        assert_eq!(back, Tier::Governance);
    }

    #[test]
    fn test_tier_from_str_is_lenient() {
        assert_eq!("stm".parse::<Tier>().unwrap(), Tier::Stm);
        assert_eq!("LTM".parse::<Tier>().unwrap(), Tier::Ltm);
        assert_eq!("governance".parse::<Tier>().unwrap(), Tier::Governance);
        assert!(matches!(
            "cache".parse::<Tier>(),
            Err(FabricError::UnknownTier(_))
        ));
    }

    #[test]
    fn test_tier_properties() {
        assert!(!Tier::Stm.is_synchronized());
        assert!(Tier::Wm.is_synchronized());
        assert!(Tier::Ltm.is_tenant_scoped());
        assert!(!Tier::Em.is_tenant_scoped());
        assert!(Tier::Governance.is_immutable());
        assert!(Tier::Stm.is_evicting() && Tier::Wm.is_evicting());
        assert!(!Tier::Ltm.is_evicting());
        assert!(Tier::Em.is_last_write_wins());
        assert!(!Tier::Sm.is_last_write_wins());
    }

    #[test]
    fn test_tier_order_volatile_to_durable() {
        let mut tiers = Tier::ALL.to_vec();
        tiers.sort();
        assert_eq!(tiers.first(), Some(&Tier::Stm));
        assert_eq!(tiers.last(), Some(&Tier::Governance));
    }

    // ── Embodiment tests ───────────────────────────────────────

    #[test]
    fn test_embodiment_names_round_trip() {
        for e in Embodiment::ALL {
            assert_eq!(e.as_str().parse::<Embodiment>().unwrap(), e);
            let json = serde_json::to_string(&e).unwrap();
            assert_eq!(json, format!("\"{}\"", e.as_str()));
        }
    }

    #[test]
    fn test_unknown_embodiment() {
        let err = "dashboard".parse::<Embodiment>().unwrap_err();
        assert!(err.to_string().contains("dashboard"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
    }

    // ── Entry tests ────────────────────────────────────────────

    #[test]
    fn test_new_entry_defaults() {
        let entry = MemoryEntry::new(
            Tier::Stm,
            Embodiment::Foreman,
            "scratch",
            "planner",
            MemoryContent::new("note", json!({"text": "hi"})),
        );
        assert!(entry.id.starts_with("stm_"));
        assert_eq!(entry.version(), 1);
        assert!(!entry.metadata.encrypted);
        assert_eq!(entry.metadata.volatile, Some(true));
        assert_eq!(entry.metadata.isolation_boundary, IsolationBoundary::Shared);
    }

    #[test]
    fn test_ltm_entry_defaults_to_encrypted_tenant_boundary() {
        let entry = ltm_entry();
        assert!(entry.id.starts_with("ltm_"));
        assert!(entry.metadata.encrypted);
        assert_eq!(entry.metadata.isolation_boundary, IsolationBoundary::Tenant);
        assert!(entry.check_invariants().is_ok());
    }

    #[test]
    fn test_wire_shape_is_camel_case_with_z_timestamps() {
        let entry = ltm_entry().with_tags(["gdpr"]);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["tenantId"], "tenant_a");
        assert_eq!(value["tier"], "LTM");
        assert_eq!(value["embodiment"], "isms_runtime");
        assert_eq!(value["content"]["type"], "risk");
        assert_eq!(value["content"]["sensitivity"], "high");
        assert_eq!(value["metadata"]["isolationBoundary"], "tenant");
        assert_eq!(value["tags"], json!(["gdpr"]));

        let created = value["metadata"]["createdAt"].as_str().unwrap();
        assert!(created.contains('T'));
        assert!(created.ends_with('Z'));
        // yyyy-mm-ddThh:mm:ss.mmmZ
        assert_eq!(created.len(), 24);
    }

    #[test]
    fn test_wire_round_trip_preserves_entry() {
        let entry = ltm_entry();
        let json = serde_json::to_string(&entry).unwrap();
        let back: MemoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_deserialize_accepts_offset_timestamps() {
        let raw = json!({
            "id": "em_1",
            "tier": "EM",
            "embodiment": "foreman",
            "category": "build",
            "actor": "orchestrator",
            "content": {"type": "event", "data": {}},
            "metadata": {
                "createdAt": "2025-01-01T10:00:00+02:00",
                "updatedAt": "2025-01-01T08:00:00.500Z",
                "version": 2,
                "encrypted": false,
                "isolationBoundary": "none"
            }
        });
        let entry: MemoryEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(entry.metadata.created_at.to_rfc3339(), "2025-01-01T08:00:00+00:00");
        assert!(entry.tags.is_empty());
        assert!(entry.check_invariants().is_ok());
    }

    #[test]
    fn test_ltm_without_tenant_violates_invariants() {
        let mut entry = ltm_entry();
        entry.tenant_id = None;
        assert!(matches!(
            entry.check_invariants(),
            Err(FabricError::InvalidEntry(_))
        ));
    }

    #[test]
    fn test_ltm_unencrypted_violates_invariants() {
        let mut entry = ltm_entry();
        entry.metadata.encrypted = false;
        assert!(matches!(
            entry.check_invariants(),
            Err(FabricError::EncryptionPolicyViolation(_))
        ));
    }

    #[test]
    fn test_ltm_content_needs_sensitivity() {
        let content = MemoryContent::new("risk", json!({}));
        assert!(content.validate_for(Tier::Em).is_ok());
        assert!(content.validate_for(Tier::Ltm).is_err());
        assert!(MemoryContent::new("  ", json!({})).validate_for(Tier::Em).is_err());
    }

    #[test]
    fn test_next_version_increments_by_one() {
        let entry = ltm_entry();
        let next = entry.next_version(
            MemoryContent::new("risk", json!({"risk": "mitigated"}))
                .with_sensitivity(Sensitivity::High),
        );
        assert_eq!(next.version(), entry.version() + 1);
        assert_eq!(next.id, entry.id);
        assert!(next.metadata.updated_at >= entry.metadata.updated_at);
        assert_eq!(next.metadata.created_at, entry.metadata.created_at);
    }

    #[test]
    fn test_canonical_content_is_key_order_independent() {
        let a = MemoryContent::new("x", json!({"b": 1, "a": 2}));
        let b = MemoryContent::new("x", json!({"a": 2, "b": 1}));
        assert_eq!(a.canonical(), b.canonical());
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_messages() {
        assert_eq!(
            FabricError::GovernanceImmutable.to_string(),
            "Governance Memory is immutable"
        );
        let err = FabricError::ArcApprovalRequired("LTM deletion".into());
        assert!(err.to_string().starts_with("ARC approval required"));
        let err = FabricError::VersionConflict {
            tier: Tier::Em,
            id: "em_1".into(),
            expected: Some(1),
            found: Some(3),
        };
        assert!(err.to_string().contains("em_1"));
    }

    #[test]
    fn test_error_severity_mapping() {
        assert_eq!(
            FabricError::TenantIsolationViolation("x".into()).severity(),
            Severity::Critical
        );
        assert_eq!(
            FabricError::EmbodimentPrivilegeViolation("x".into()).severity(),
            Severity::High
        );
        assert_eq!(
            FabricError::GuardrailViolation {
                rule: "r".into(),
                reason: "x".into()
            }
            .severity(),
            Severity::Critical
        );
    }

    #[test]
    fn test_only_conflicts_and_delivery_failures_recover() {
        assert!(
            FabricError::SyncDeliveryFailure {
                target: "foreman_app".into(),
                reason: "timeout".into()
            }
            .is_recoverable()
        );
        assert!(!FabricError::TenantIsolationViolation("x".into()).is_recoverable());
        assert!(!FabricError::SecretDetected { count: 1 }.is_recoverable());
    }

    #[test]
    fn test_error_from_serde() {
        let bad: std::result::Result<MemoryEntry, _> = serde_json::from_str("{");
        let err: FabricError = bad.unwrap_err().into();
        assert_eq!(err.code(), "serialization");
    }

    // ── Event bus tests ────────────────────────────────────────

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(FabricEvent::EntryStored {
            tier: Tier::Em,
            id: "em_1".into(),
            embodiment: Embodiment::Foreman,
        });
        match rx.recv().await.unwrap() {
            FabricEvent::EntryStored { id, .. } => assert_eq!(id, "em_1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_bus_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(FabricEvent::Shutdown);
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let json = serde_json::to_value(FabricEvent::EntriesPruned {
            tier: Tier::Wm,
            count: 3,
        })
        .unwrap();
        assert_eq!(json["kind"], "entries_pruned");
        assert_eq!(json["tier"], "WM");
    }
}
