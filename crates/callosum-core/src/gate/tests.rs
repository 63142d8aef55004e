//! Decision-procedure tests over a temp state directory.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::classifier::{Rule, RuleSet, ToolPattern};
use crate::store::JournalAction;

fn params(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("test params must be an object"),
    }
}

fn config(dir: &TempDir, instance: &str) -> GateConfig {
    let mut config = GateConfig::new(instance);
    config.state_dir = dir.path().to_path_buf();
    config
}

fn gate(dir: &TempDir, instance: &str) -> Gate {
    Gate::new(config(dir, instance)).expect("gate builds")
}

fn email_params(rcpt: &str) -> Params {
    params(json!({
        "command": format!("curl --url 'smtp://mail' --mail-rcpt '{rcpt}' -T body")
    }))
}

#[test]
fn test_tier0_call_allows_and_journals_intercept() {
    let dir = TempDir::new().expect("temp dir");
    let gate = gate(&dir, "alpha");

    let verdict = gate.intercept("alpha", "weather", &Params::new());
    assert!(matches!(
        verdict,
        Verdict::Allow {
            tier: Tier::Inert,
            context_key: None,
            ..
        }
    ));

    // The audit contract: even inert calls leave an intercept line.
    let tail = gate.store().journal_tail(10).expect("tail");
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].action, JournalAction::Intercept);
    assert_eq!(tail[0].tool, "weather");
}

#[test]
fn test_commitment_call_takes_lock_and_releases_on_complete() {
    let dir = TempDir::new().expect("temp dir");
    let gate = gate(&dir, "alpha");
    let p = email_params("alice@example.com");

    let verdict = gate.intercept("alpha", "exec", &p);
    let Verdict::Allow {
        tier, context_key, ..
    } = &verdict
    else {
        panic!("expected allow, got {verdict:?}");
    };
    assert_eq!(*tier, Tier::Commitment);
    assert_eq!(context_key.as_deref(), Some("email:alice@example.com"));

    let snapshot = gate.store().snapshot(None).expect("snapshot");
    assert_eq!(snapshot.locks.len(), 1);
    assert_eq!(snapshot.locks[0].context_key, "email:alice@example.com");

    gate.complete("alpha", "exec", &p, None);
    let snapshot = gate.store().snapshot(None).expect("snapshot");
    assert!(snapshot.locks.is_empty());

    let tail = gate.store().journal_tail(10).expect("tail");
    assert_eq!(
        tail.iter().map(|e| e.action).collect::<Vec<_>>(),
        vec![JournalAction::Intercept, JournalAction::Complete]
    );
}

#[test]
fn test_failed_call_journals_failed() {
    let dir = TempDir::new().expect("temp dir");
    let gate = gate(&dir, "alpha");
    let p = email_params("alice@example.com");

    let _ = gate.intercept("alpha", "exec", &p);
    gate.complete("alpha", "exec", &p, Some("SMTP 550"));

    let tail = gate.store().journal_tail(10).expect("tail");
    assert_eq!(tail.last().map(|e| e.action), Some(JournalAction::Failed));
    assert!(tail
        .last()
        .and_then(|e| e.conflict_note.as_deref())
        .is_some_and(|note| note.contains("SMTP 550")));
}

#[test]
fn test_self_duplicate_pauses() {
    let dir = TempDir::new().expect("temp dir");
    let gate = gate(&dir, "alpha");
    let p = email_params("alice@example.com");

    let _ = gate.intercept("alpha", "exec", &p);
    gate.complete("alpha", "exec", &p, None);

    let verdict = gate.intercept("alpha", "exec", &p);
    let Verdict::Pause { reason } = &verdict else {
        panic!("expected pause, got {verdict:?}");
    };
    assert!(reason.contains("alpha"));
    assert!(reason.contains("email:alice@example.com"));
    assert!(reason.contains("retry"));

    // The refusal itself is journaled.
    let tail = gate.store().journal_tail(10).expect("tail");
    assert_eq!(tail.last().map(|e| e.action), Some(JournalAction::Blocked));
}

#[test]
fn test_self_duplicate_check_can_be_disabled() {
    let dir = TempDir::new().expect("temp dir");
    let mut cfg = config(&dir, "alpha");
    cfg.self_duplicate_check = false;
    let gate = Gate::new(cfg).expect("gate builds");
    let p = email_params("alice@example.com");

    let _ = gate.intercept("alpha", "exec", &p);
    gate.complete("alpha", "exec", &p, None);

    // Own completions no longer pause...
    assert!(!gate.intercept("alpha", "exec", &p).is_blocking());
    gate.complete("alpha", "exec", &p, None);

    // ...but another instance's do.
    let beta = Gate::new({
        let mut c = config(&dir, "beta");
        c.self_duplicate_check = false;
        c
    })
    .expect("gate builds");
    assert!(matches!(
        beta.intercept("beta", "exec", &p),
        Verdict::Pause { .. }
    ));
}

#[test]
fn test_duplicate_outside_rule_window_allows() {
    let dir = TempDir::new().expect("temp dir");

    let mut rule = Rule::new("email-short", 3, ToolPattern::One("email".to_string()));
    rule.context_key_template = Some("email:{params.to}".to_string());
    rule.recent_window_ms = Some(50);
    let rules = RuleSet {
        description: None,
        rules: vec![rule],
    };

    let gate = Gate::with_rules(config(&dir, "alpha"), &rules).expect("gate builds");
    let p = params(json!({"to": "alice@example.com"}));

    let _ = gate.intercept("alpha", "email", &p);
    gate.complete("alpha", "email", &p, None);

    // Inside the 50 ms rule window: pause.
    assert!(gate.intercept("alpha", "email", &p).is_blocking());
    std::thread::sleep(Duration::from_millis(80));
    // Outside it: the rule window overrides the hour-long default.
    assert!(!gate.intercept("alpha", "email", &p).is_blocking());
}

#[test]
fn test_tier4_lock_conflict_blocks_other_instance() {
    let dir = TempDir::new().expect("temp dir");
    let alpha = gate(&dir, "alpha");
    let beta = gate(&dir, "beta");
    let p = params(json!({"action": "channel-delete"}));

    assert!(!alpha.intercept("alpha", "message", &p).is_blocking());

    let verdict = beta.intercept("beta", "message", &p);
    let Verdict::Block { reason } = &verdict else {
        panic!("expected block, got {verdict:?}");
    };
    assert!(reason.contains("alpha"));
    assert!(reason.contains("message:channel-delete"));
}

#[test]
fn test_tier2_cross_instance_race_allows_both() {
    let dir = TempDir::new().expect("temp dir");
    let alpha = gate(&dir, "alpha");
    let beta = gate(&dir, "beta");
    let p = params(json!({"action": "thread-reply", "target": "andy", "replyTo": "msg-500"}));

    assert!(!alpha.intercept("alpha", "message", &p).is_blocking());
    // Tier 2 records context but never blocks.
    assert!(!beta.intercept("beta", "message", &p).is_blocking());

    alpha.complete("alpha", "message", &p, None);
    beta.complete("beta", "message", &p, None);
}

#[test]
fn test_tier3_conflict_warns_but_proceeds() {
    let dir = TempDir::new().expect("temp dir");
    let alpha = gate(&dir, "alpha");
    let beta = gate(&dir, "beta");

    // alpha holds the key's lock (call still in flight).
    let p = email_params("alice@example.com");
    assert!(!alpha.intercept("alpha", "exec", &p).is_blocking());

    // beta targets the same recipient before alpha completes: tier 3
    // proceeds with a warning rather than blocking.
    let verdict = beta.intercept("beta", "exec", &p);
    let Verdict::Allow { warning, .. } = &verdict else {
        panic!("expected allow, got {verdict:?}");
    };
    assert!(warning.as_deref().is_some_and(|w| w.contains("alpha")));
}

#[test]
fn test_distinct_keys_do_not_interact() {
    let dir = TempDir::new().expect("temp dir");
    let alpha = gate(&dir, "alpha");
    let beta = gate(&dir, "beta");

    let to_alice = email_params("alice@example.com");
    let to_bob = email_params("bob@example.com");

    assert!(!alpha.intercept("alpha", "exec", &to_alice).is_blocking());
    assert!(!beta.intercept("beta", "exec", &to_bob).is_blocking());
    alpha.complete("alpha", "exec", &to_alice, None);
    beta.complete("beta", "exec", &to_bob, None);

    let completes = alpha
        .store()
        .journal_tail(20)
        .expect("tail")
        .into_iter()
        .filter(|e| e.action == JournalAction::Complete)
        .count();
    assert_eq!(completes, 2);
}

#[test]
fn test_complete_key_releases_lock() {
    let dir = TempDir::new().expect("temp dir");
    let gate = gate(&dir, "server");
    let p = email_params("alice@example.com");

    assert!(!gate.intercept("alpha", "exec", &p).is_blocking());
    gate.complete_key("alpha", "email:alice@example.com", true)
        .expect("complete");

    assert!(gate.store().snapshot(None).expect("snapshot").locks.is_empty());
    let tail = gate.store().journal_tail(10).expect("tail");
    let last = tail.last().expect("entries");
    assert_eq!(last.action, JournalAction::Complete);
    // The pre-call snapshot supplied the real tool and rule.
    assert_eq!(last.tool, "exec");
    assert_eq!(last.rule_name, "email-send");
}

#[test]
fn test_complete_key_without_snapshot_still_journals() {
    let dir = TempDir::new().expect("temp dir");
    let gate = gate(&dir, "server");

    gate.complete_key("alpha", "email:alice@example.com", false)
        .expect("complete");
    let tail = gate.store().journal_tail(10).expect("tail");
    assert_eq!(tail.last().map(|e| e.action), Some(JournalAction::Failed));
}

#[test]
fn test_hook_surface_uses_own_instance() {
    let dir = TempDir::new().expect("temp dir");
    let gate = gate(&dir, "alpha");

    let before = BeforeToolCall {
        tool_name: "exec".to_string(),
        params: email_params("alice@example.com"),
    };
    let verdict = gate.before_tool_call(&before);
    assert!(!verdict.is_blocking());

    gate.after_tool_call(&AfterToolCall {
        tool_name: "exec".to_string(),
        params: before.params.clone(),
        error: None,
    });

    let tail = gate.store().journal_tail(10).expect("tail");
    assert!(tail.iter().all(|e| e.instance == "alpha"));
    assert_eq!(tail.last().map(|e| e.action), Some(JournalAction::Complete));
}

#[test]
fn test_lock_expiry_frees_key_without_cleanup() {
    let dir = TempDir::new().expect("temp dir");
    let mut cfg = config(&dir, "alpha");
    cfg.lock_expiry_ms = 1;
    let alpha = Gate::new(cfg).expect("gate builds");
    let beta = gate(&dir, "beta");

    let p = email_params("alice@example.com");
    assert!(!alpha.intercept("alpha", "exec", &p).is_blocking());
    // alpha crashes: no post-call ever arrives, the lock just lapses.
    std::thread::sleep(Duration::from_millis(20));

    let verdict = beta.intercept("beta", "exec", &p);
    assert!(!verdict.is_blocking());
    let locks = beta.store().snapshot(None).expect("snapshot").locks;
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].instance, "beta");
}

#[test]
fn test_user_rule_overrides_builtin_ordering() {
    let dir = TempDir::new().expect("temp dir");

    let mut override_rule = Rule::new("git-push", 3, ToolPattern::One("exec".to_string()));
    override_rule.command_pattern = Some("git push".to_string());
    override_rule.context_key_template = Some("git-push".to_string());

    let mut rules = vec![override_rule];
    rules.extend(crate::classifier::builtin_rule_set().rules);
    let rules = RuleSet {
        description: None,
        rules,
    };

    let gate = Gate::with_rules(config(&dir, "alpha"), &rules).expect("gate builds");
    let p = params(json!({"command": "git push origin main"}));

    let verdict = gate.intercept("alpha", "exec", &p);
    let Verdict::Allow {
        tier,
        context_key,
        rule_name,
        ..
    } = &verdict
    else {
        panic!("expected allow, got {verdict:?}");
    };
    assert_eq!(*tier, Tier::Commitment);
    assert_eq!(rule_name, "git-push");
    assert_eq!(context_key.as_deref(), Some("git-push"));

    // And it participates in duplicate detection.
    gate.complete("alpha", "exec", &p, None);
    assert!(gate.intercept("alpha", "exec", &p).is_blocking());
}

#[test]
fn test_rules_file_loaded_from_state_dir() {
    let dir = TempDir::new().expect("temp dir");
    std::fs::create_dir_all(dir.path()).expect("dir");
    std::fs::write(
        dir.path().join("tiers.json"),
        r#"{
            "description": "test rules",
            "rules": [
                {
                    "name": "everything-hot",
                    "tier": 3,
                    "toolPattern": "*",
                    "contextKeyTemplate": "all:{tool}"
                }
            ]
        }"#,
    )
    .expect("write rules");

    let gate = gate(&dir, "alpha");
    let verdict = gate.intercept("alpha", "anything", &Params::new());
    let Verdict::Allow {
        tier, rule_name, ..
    } = &verdict
    else {
        panic!("expected allow, got {verdict:?}");
    };
    assert_eq!(*tier, Tier::Commitment);
    assert_eq!(rule_name, "everything-hot");
}

#[test]
fn test_broken_rules_file_refuses_to_start() {
    let dir = TempDir::new().expect("temp dir");
    std::fs::create_dir_all(dir.path()).expect("dir");
    std::fs::write(
        dir.path().join("tiers.json"),
        r#"{"rules": [{"name": "bad", "tier": 9, "toolPattern": "*"}]}"#,
    )
    .expect("write rules");

    let err = Gate::new(config(&dir, "alpha")).expect_err("tier 9 must refuse");
    assert!(matches!(
        err,
        GateError::Config(ConfigError::InvalidTier { tier: 9, .. })
    ));
}

#[test]
fn test_params_digest_is_stable_and_order_insensitive() {
    let a = params(json!({"x": 1, "y": "two"}));
    let b = params(json!({"y": "two", "x": 1}));
    assert_eq!(params_digest(&a), params_digest(&b));
    assert_eq!(params_digest(&a).len(), 16);
    assert_ne!(params_digest(&a), params_digest(&Params::new()));
}
