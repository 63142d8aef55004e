//! End-to-end coordination scenarios over a shared state directory.
//!
//! Each test plays out one multi-session story through the public API:
//! duplicate email detection, racing thread replies, irreversible-action
//! races, and lock expiry after a crashed session.

use serde_json::json;
use tempfile::TempDir;

use callosum_core::{Gate, GateConfig, JournalAction, Params, Tier, Verdict};

fn params(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("test params must be an object"),
    }
}

fn gate_in(dir: &TempDir, instance: &str) -> Gate {
    let mut config = GateConfig::new(instance);
    config.state_dir = dir.path().to_path_buf();
    Gate::new(config).expect("gate builds")
}

fn email_command(rcpt: &str) -> Params {
    params(json!({
        "command": format!(
            "curl --url 'smtp://mail.example.com' --mail-rcpt '{rcpt}' --upload-file /tmp/body.txt"
        )
    }))
}

/// Scenario: the same session sends the same email twice. The second
/// attempt pauses and the reason names the earlier action.
#[test]
fn email_duplicate_from_same_instance_pauses() {
    let dir = TempDir::new().expect("temp dir");
    let alpha = gate_in(&dir, "alpha");
    let p = email_command("alice@example.com");

    let first = alpha.intercept("alpha", "exec", &p);
    let Verdict::Allow {
        tier,
        context_key,
        rule_name,
        ..
    } = &first
    else {
        panic!("first send must be allowed, got {first:?}");
    };
    assert_eq!(*tier, Tier::Commitment);
    assert_eq!(rule_name, "email-send");
    assert_eq!(context_key.as_deref(), Some("email:alice@example.com"));
    alpha.complete("alpha", "exec", &p, None);

    // Minutes later, the identical call arrives again.
    let second = alpha.intercept("alpha", "exec", &p);
    let Verdict::Pause { reason } = &second else {
        panic!("duplicate must pause, got {second:?}");
    };
    assert!(reason.contains("alpha"), "reason names the prior instance");
    assert!(reason.contains("email:alice@example.com"));
    assert!(
        reason.contains("retry"),
        "pause invites a deliberate retry: {reason}"
    );
    assert!(second.is_blocking(), "the tool must not run");
}

/// Scenario: two instances reply into the same thread inside the context
/// window. Tier 2 has no blocking enforcement, so both proceed.
#[test]
fn thread_race_between_instances_allows_both() {
    let dir = TempDir::new().expect("temp dir");
    let alpha = gate_in(&dir, "alpha");
    let beta = gate_in(&dir, "beta");
    let p = params(json!({
        "action": "thread-reply",
        "target": "andy",
        "replyTo": "msg-500"
    }));

    let first = alpha.intercept("alpha", "message", &p);
    let Verdict::Allow {
        tier, context_key, ..
    } = &first
    else {
        panic!("expected allow, got {first:?}");
    };
    assert_eq!(*tier, Tier::Routine);
    assert_eq!(context_key.as_deref(), Some("channel:andy"));

    let second = beta.intercept("beta", "message", &p);
    assert!(!second.is_blocking(), "tier 2 never blocks");

    alpha.complete("alpha", "message", &p, None);
    beta.complete("beta", "message", &p, None);

    // Neither call was refused: both intercepts journaled, nothing
    // blocked, and both instances left a context trace on the channel.
    let tail = alpha.store().journal_tail(20).expect("tail");
    let intercepts = tail
        .iter()
        .filter(|entry| entry.action == JournalAction::Intercept)
        .count();
    assert_eq!(intercepts, 2);
    assert!(tail.iter().all(|entry| entry.action != JournalAction::Blocked));

    let contexts = alpha
        .store()
        .snapshot(Some("channel:andy"))
        .expect("snapshot")
        .recent_contexts;
    let instances: Vec<_> = contexts.iter().map(|r| r.instance.as_str()).collect();
    assert!(instances.contains(&"alpha") && instances.contains(&"beta"));
}

/// Scenario: two instances race on an irreversible channel delete. The
/// second is blocked by the first's advisory lock, with the holder named.
#[test]
fn irreversible_race_blocks_second_instance() {
    let dir = TempDir::new().expect("temp dir");
    let alpha = gate_in(&dir, "alpha");
    let beta = gate_in(&dir, "beta");
    let p = params(json!({"action": "channel-delete"}));

    let first = alpha.intercept("alpha", "message", &p);
    let Verdict::Allow { tier, .. } = &first else {
        panic!("expected allow, got {first:?}");
    };
    assert_eq!(*tier, Tier::Irreversible);

    // Before alpha's post-call arrives, beta issues the identical call.
    let second = beta.intercept("beta", "message", &p);
    let Verdict::Block { reason } = &second else {
        panic!("expected block, got {second:?}");
    };
    assert!(reason.contains("alpha"), "reason names the holder: {reason}");

    // The refused call is journaled as blocked.
    let blocked = beta
        .store()
        .journal_tail(20)
        .expect("tail")
        .into_iter()
        .filter(|entry| entry.action == JournalAction::Blocked)
        .count();
    assert_eq!(blocked, 1);
}

/// Scenario: different recipients produce different context keys, so two
/// instances emailing different people never interact.
#[test]
fn different_recipients_do_not_conflict() {
    let dir = TempDir::new().expect("temp dir");
    let alpha = gate_in(&dir, "alpha");
    let beta = gate_in(&dir, "beta");

    let to_alice = email_command("alice@example.com");
    let to_bob = email_command("bob@example.com");

    let a = alpha.intercept("alpha", "exec", &to_alice);
    assert!(!a.is_blocking());
    let b = beta.intercept("beta", "exec", &to_bob);
    if let Verdict::Allow { warning, .. } = &b {
        assert!(warning.is_none(), "distinct keys must not warn: {warning:?}");
    } else {
        panic!("expected allow, got {b:?}");
    }

    alpha.complete("alpha", "exec", &to_alice, None);
    beta.complete("beta", "exec", &to_bob, None);

    let tail = alpha.store().journal_tail(20).expect("tail");
    let completes: Vec<_> = tail
        .iter()
        .filter(|entry| entry.action == JournalAction::Complete)
        .collect();
    assert_eq!(completes.len(), 2);
}

/// Scenario: a user-supplied rule prepended to the defaults reclassifies
/// `git push` from generic tier-1 exec to a tier-3 commitment that
/// participates in duplicate detection.
#[test]
fn prepended_user_rule_overrides_classification() {
    let dir = TempDir::new().expect("temp dir");
    std::fs::create_dir_all(dir.path()).expect("dir");

    // A tiers.json with the user override ahead of rules equivalent to
    // the defaults' tail.
    std::fs::write(
        dir.path().join("tiers.json"),
        r#"{
            "description": "git push is an external commitment",
            "rules": [
                {
                    "name": "git-push",
                    "tier": 3,
                    "toolPattern": "exec",
                    "commandPattern": "git push",
                    "contextKeyTemplate": "git-push"
                },
                {
                    "name": "exec-general",
                    "tier": 1,
                    "toolPattern": "exec"
                }
            ]
        }"#,
    )
    .expect("write rules");

    let gate = gate_in(&dir, "alpha");
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

    // Other exec calls still classify through the later rule.
    let ls = gate.intercept("alpha", "exec", &params(json!({"command": "ls"})));
    let Verdict::Allow {
        tier, rule_name, ..
    } = &ls
    else {
        panic!("expected allow, got {ls:?}");
    };
    assert_eq!(*tier, Tier::Internal);
    assert_eq!(rule_name, "exec-general");

    // The override participates in duplicate detection.
    gate.complete("alpha", "exec", &p, None);
    assert!(gate.intercept("alpha", "exec", &p).is_blocking());
}

/// Scenario: a session dies holding a lock with a tiny TTL; expiry alone
/// frees the key for the next session.
#[test]
fn expired_lock_needs_no_manual_cleanup() {
    let dir = TempDir::new().expect("temp dir");
    let mut config = GateConfig::new("alpha");
    config.state_dir = dir.path().to_path_buf();
    config.lock_expiry_ms = 1;
    let alpha = Gate::new(config).expect("gate builds");
    let beta = gate_in(&dir, "beta");

    let p = email_command("alice@example.com");
    assert!(!alpha.intercept("alpha", "exec", &p).is_blocking());
    // alpha never completes; its 1 ms lock lapses on its own.
    std::thread::sleep(std::time::Duration::from_millis(25));

    let verdict = beta.intercept("beta", "exec", &p);
    assert!(!verdict.is_blocking(), "expired lock is treated as absent");
    let locks = beta.store().snapshot(None).expect("snapshot").locks;
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].instance, "beta");
    beta.complete("beta", "exec", &p, None);
}
