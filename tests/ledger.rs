//! Ledger Integration Tests
//!
//! Recording, replay, query and review against an on-disk database.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use govflow::adapters::{
    PolicyContext, PolicyRequest, PolicyResource, PolicyResponse, PolicySubject, RequestMetadata,
};
use govflow::api::{ApiError, LedgerApi, LedgerEventsQuery};
use govflow::core::{Database, LedgerRecorder, LedgerStore, RecordMetadata, SystemClock};
use govflow::domain::{Actor, Decision, Layer, LedgerLevel, NewLedgerEvent};
use govflow::evidence::{Claim, Evidence};

fn open(dir: &TempDir) -> LedgerRecorder {
    let db = Database::open(dir.path().join("ledger.db")).unwrap();
    LedgerRecorder::new(LedgerStore::new(db), Arc::new(SystemClock))
}

fn request(actor: &Actor, action: &str, correlation_id: Uuid) -> PolicyRequest {
    PolicyRequest {
        subject: PolicySubject::from_actor(actor),
        action: action.to_string(),
        resource: PolicyResource {
            resource_type: "assignment".to_string(),
            id: Some("asg-42".to_string()),
            attributes: None,
        },
        context: PolicyContext {
            evidence: Evidence::new()
                .assert("enrolled")
                .claim(Claim::new("mfa", json!(true))),
            request_metadata: RequestMetadata {
                host: "lms.example.edu".to_string(),
                service: "gradebook".to_string(),
                correlation_id,
                intent_id: None,
            },
        },
    }
}

fn response(decision: Decision, level: LedgerLevel) -> PolicyResponse {
    PolicyResponse {
        decision,
        policy_id: Some("gradebook-policy".to_string()),
        policy_version: Some("7".to_string()),
        reason: None,
        required_ledger_level: level,
    }
}

fn new_event(correlation_id: Uuid, action: &str, decision: Decision) -> NewLedgerEvent {
    NewLedgerEvent {
        correlation_id,
        intent_id: None,
        sequence_num: None,
        layer: Layer::Mesh,
        host: "agents.example.com".to_string(),
        service: "grader".to_string(),
        policy_scope: "mesh:grader".to_string(),
        actor: Actor::agent("grader-bot", "grader"),
        action: action.to_string(),
        resource_type: "submission".to_string(),
        resource_id: None,
        decision,
        policy_id: None,
        policy_version: None,
        evidence: Evidence::default(),
        ledger_level: LedgerLevel::Decision,
        required_ledger_level: LedgerLevel::Decision,
        request_context: None,
        response_summary: None,
        metadata: None,
        occurred_at: Utc::now(),
    }
}

#[test]
fn test_events_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let correlation_id = Uuid::new_v4();
    let instructor = Actor::user("u-17", "instructor");

    let recorded = {
        let recorder = open(&dir);
        recorder
            .record(
                &request(&instructor, "assignment:create", correlation_id),
                &response(Decision::Allow, LedgerLevel::Decision),
                None,
                None,
                None,
            )
            .unwrap()
    };

    assert_eq!(recorded.layer, Layer::Experience);
    assert_eq!(recorded.policy_scope, "experience:gradebook");
    assert_eq!(recorded.resource_id.as_deref(), Some("asg-42"));
    assert_eq!(recorded.sequence_num, 1);

    let reopened = open(&dir);
    let stored = reopened.store().get(recorded.id).unwrap().unwrap();
    assert_eq!(stored.correlation_id, correlation_id);
    assert_eq!(stored.action, "assignment:create");
    assert_eq!(stored.policy_id.as_deref(), Some("gradebook-policy"));
    assert_eq!(stored.actor, instructor);
    assert_eq!(stored.evidence.asserted_facts(), vec!["enrolled"]);
    assert_eq!(stored.evidence.claims[0].name, "mfa");
}

#[test]
fn test_sequence_numbers_per_correlation() {
    let dir = TempDir::new().unwrap();
    let recorder = open(&dir);
    let actor = Actor::user("u-17", "instructor");
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    for correlation_id in [first, second, first, first] {
        recorder
            .record(
                &request(&actor, "assignment:update", correlation_id),
                &response(Decision::Allow, LedgerLevel::Decision),
                None,
                None,
                None,
            )
            .unwrap();
    }

    let chain: Vec<i64> = recorder
        .store()
        .by_correlation(first)
        .unwrap()
        .iter()
        .map(|e| e.sequence_num)
        .collect();
    assert_eq!(chain, vec![1, 2, 3]);
    assert_eq!(recorder.store().by_correlation(second).unwrap().len(), 1);
}

#[test]
fn test_replayed_event_is_stored_once() {
    let dir = TempDir::new().unwrap();
    let recorder = open(&dir);
    let correlation_id = Uuid::new_v4();
    let actor = Actor::user("u-17", "instructor");

    let metadata = || RecordMetadata {
        sequence_num: Some(4),
        ..Default::default()
    };

    let first = recorder
        .record(
            &request(&actor, "grade:publish", correlation_id),
            &response(Decision::Allow, LedgerLevel::Decision),
            None,
            Some(metadata()),
            None,
        )
        .unwrap();
    let replay = recorder
        .record(
            &request(&actor, "grade:publish", correlation_id),
            &response(Decision::Allow, LedgerLevel::Decision),
            None,
            Some(metadata()),
            None,
        )
        .unwrap();

    assert_eq!(first.id, replay.id);
    assert_eq!(replay.sequence_num, 4);
    assert_eq!(recorder.store().by_correlation(correlation_id).unwrap().len(), 1);
}

#[test]
fn test_required_level_wins_over_lower_override() {
    let dir = TempDir::new().unwrap();
    let recorder = open(&dir);
    let actor = Actor::user("u-17", "instructor");

    let metadata = RecordMetadata {
        request_context: Some(json!({"path": "/grades/42"})),
        response_summary: Some(json!({"status": 200})),
        ..Default::default()
    };
    let event = recorder
        .record(
            &request(&actor, "grade:override", Uuid::new_v4()),
            &response(Decision::Warn, LedgerLevel::Full),
            None,
            Some(metadata),
            Some(LedgerLevel::Decision),
        )
        .unwrap();

    assert_eq!(event.ledger_level, LedgerLevel::Full);
    assert_eq!(event.required_ledger_level, LedgerLevel::Full);
    assert_eq!(event.request_context, Some(json!({"path": "/grades/42"})));
}

#[test]
fn test_action_level_drops_request_context() {
    let dir = TempDir::new().unwrap();
    let recorder = open(&dir);
    let actor = Actor::user("u-17", "instructor");

    let metadata = RecordMetadata {
        request_context: Some(json!({"body": "large"})),
        response_summary: Some(json!({"status": 201})),
        ..Default::default()
    };
    let event = recorder
        .record(
            &request(&actor, "assignment:create", Uuid::new_v4()),
            &response(Decision::Allow, LedgerLevel::Action),
            None,
            Some(metadata),
            None,
        )
        .unwrap();

    assert_eq!(event.ledger_level, LedgerLevel::Action);
    assert_eq!(event.request_context, None);
    assert_eq!(event.response_summary, Some(json!({"status": 201})));
}

#[test]
fn test_query_filters_and_paging() {
    let dir = TempDir::new().unwrap();
    let api = LedgerApi::new(open(&dir));
    let correlation_id = Uuid::new_v4();

    for (action, decision) in [
        ("submission:grade", Decision::Allow),
        ("submission:grade", Decision::Deny),
        ("submission:read", Decision::Allow),
        ("submission:grade", Decision::ShadowDeny),
    ] {
        api.post_event(new_event(correlation_id, action, decision)).unwrap();
    }
    api.post_event(new_event(Uuid::new_v4(), "submission:grade", Decision::Allow))
        .unwrap();

    let all = api
        .get_events(LedgerEventsQuery {
            correlation_id: Some(correlation_id.to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(all.total, 4);

    let graded = api
        .get_events(LedgerEventsQuery {
            correlation_id: Some(correlation_id.to_string()),
            action: Some("submission:grade".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(graded.total, 3);

    let denied = api
        .get_events(LedgerEventsQuery {
            decision: Some("deny".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(denied.total, 1);
    assert_eq!(denied.events[0].decision, Decision::Deny);

    let page = api
        .get_events(LedgerEventsQuery {
            correlation_id: Some(correlation_id.to_string()),
            limit: Some(2),
            offset: Some(2),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.events.len(), 2);
    assert_eq!(page.events[0].sequence_num, 3);

    // Empty strings are treated as absent filters
    let unfiltered = api
        .get_events(LedgerEventsQuery {
            actor_user_id: Some(String::new()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(unfiltered.total, 5);
}

#[test]
fn test_compliance_review_lists_flagged_decisions() {
    let dir = TempDir::new().unwrap();
    let recorder = open(&dir);
    let correlation_id = Uuid::new_v4();

    let mut old = new_event(correlation_id, "submission:delete", Decision::Deny);
    old.occurred_at = Utc::now() - ChronoDuration::days(3);
    recorder.record_event(old).unwrap();
    for decision in [Decision::Allow, Decision::Warn, Decision::ShadowDeny] {
        recorder
            .record_event(new_event(correlation_id, "submission:grade", decision))
            .unwrap();
    }

    let store = recorder.store();
    let recent = store
        .compliance_review(Some(Utc::now() - ChronoDuration::hours(24)), 50)
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|e| e.decision.needs_review()));

    let everything = store.compliance_review(None, 50).unwrap();
    assert_eq!(everything.len(), 3);

    let counts = store.decision_counts(Some(correlation_id)).unwrap();
    assert_eq!((counts.allow, counts.deny, counts.warn, counts.shadow_deny), (1, 1, 1, 1));
}

#[test]
fn test_post_rejects_invalid_bodies() {
    let dir = TempDir::new().unwrap();
    let api = LedgerApi::new(open(&dir));

    let mut anonymous = new_event(Uuid::new_v4(), "submission:grade", Decision::Allow);
    anonymous.actor = Actor::default();
    let err = api.post_event(anonymous).unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
    assert_eq!(err.status_code(), 400);

    let err = api.post_event_json("{\"correlation_id\": 7}").unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = api
        .get_events(LedgerEventsQuery {
            intent_id: Some("not-a-uuid".to_string()),
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = api.get_event(Uuid::new_v4()).unwrap_err();
    assert_eq!(err.status_code(), 404);

    assert_eq!(api.get_events(LedgerEventsQuery::default()).unwrap().total, 0);
}

#[test]
fn test_json_body_round_trips_through_api() {
    let dir = TempDir::new().unwrap();
    let api = LedgerApi::new(open(&dir));
    let correlation_id = Uuid::new_v4();

    let mut event = new_event(correlation_id, "submission:grade", Decision::Allow);
    event.evidence = Evidence::new().assert("rubric-attached");
    let body = serde_json::to_string(&event).unwrap();

    let stored = api.post_event_json(&body).unwrap();
    assert_eq!(stored.sequence_num, 1);
    assert_eq!(stored.actor.principal(), "agent:grader-bot");

    let fetched = api.get_event(stored.id).unwrap();
    assert_eq!(fetched.evidence.asserted_facts(), vec!["rubric-attached"]);

    let by_intent = api
        .get_events(LedgerEventsQuery {
            correlation_id: Some(correlation_id.to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_intent.events, vec![fetched]);
}

#[test]
fn test_malformed_evidence_never_reaches_the_store() {
    let dir = TempDir::new().unwrap();
    let recorder = open(&dir);
    let instructor = Actor::user("u-17", "instructor");
    let correlation_id = Uuid::new_v4();

    recorder
        .record(
            &request(&instructor, "assignment:create", correlation_id),
            &response(Decision::Allow, LedgerLevel::Decision),
            None,
            None,
            None,
        )
        .unwrap();

    let mut blank_fact = request(&instructor, "assignment:grade", correlation_id);
    blank_fact.context.evidence = Evidence::new().assert("enrolled").assert("");
    let err = recorder
        .record(
            &blank_fact,
            &response(Decision::Allow, LedgerLevel::Decision),
            None,
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, govflow::GovernanceError::Validation(_)));

    let api = LedgerApi::new(open(&dir));
    let mut blank_claim = new_event(correlation_id, "submission:grade", Decision::Allow);
    blank_claim.evidence = Evidence::new().claim(Claim::new("  ", json!("x")));
    let err = api.post_event(blank_claim).unwrap_err();
    assert_eq!(err.status_code(), 400);

    // Unfiltered reads keep working
    let page = api.get_events(LedgerEventsQuery::default()).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.events[0].action, "assignment:create");
}
