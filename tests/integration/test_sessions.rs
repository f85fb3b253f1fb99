//! Session lifecycle across turns: windowing, entity isolation,
//! TTL expiry, and explicit removal.

use serde_json::json;

use caliper::config::{PipelineSettings, SessionSettings};
use caliper::entity::EntityCategory;

use crate::support::{engine, engine_with, rows, Script};

fn one_row() -> Script {
    Script::Rows(rows(json!([
        {"PressOperations.pressLine": "Line A", "PressOperations.defectRate": 2.0},
    ])))
}

#[tokio::test]
async fn window_drops_oldest_messages() {
    let session = SessionSettings {
        window: 4,
        ..Default::default()
    };
    let (orchestrator, _bus) = engine_with(one_row(), PipelineSettings::default(), session);

    let first = orchestrator.handle_turn(None, "defect rate today").await.unwrap();
    let id = first.session_id;
    orchestrator.handle_turn(Some(id), "scrap rate today").await.unwrap();
    orchestrator.handle_turn(Some(id), "pass rate today").await.unwrap();

    // Three turns produce six messages; the window keeps the last four.
    let record = orchestrator.store().snapshot(id).expect("session should exist");
    assert_eq!(record.messages.len(), 4);
    assert_eq!(record.turns, 3);
}

#[tokio::test]
async fn sessions_do_not_share_entity_context() {
    let (orchestrator, _bus) = engine(one_row());

    let doors = orchestrator
        .handle_turn(None, "defect rate for doors")
        .await
        .unwrap();

    // The same wording in a brand-new session has no antecedent.
    let fresh = orchestrator
        .handle_turn(None, "compare these by shift")
        .await
        .unwrap();
    assert!(fresh.response.clarification);

    // The session that mentioned doors resolves the reference.
    let followed = orchestrator
        .handle_turn(Some(doors.session_id), "compare these by shift")
        .await
        .unwrap();
    assert!(!followed.response.clarification);
}

#[tokio::test]
async fn concurrent_sessions_keep_entities_apart() {
    let (orchestrator, _bus) = engine(one_row());

    let (doors, bonnets) = tokio::join!(
        orchestrator.handle_turn(None, "defect rate for doors"),
        orchestrator.handle_turn(None, "tonnage for bonnets"),
    );
    let doors = doors.unwrap();
    let bonnets = bonnets.unwrap();
    assert_ne!(doors.session_id, bonnets.session_id);

    let door_state = orchestrator.store().snapshot(doors.session_id).unwrap();
    assert_eq!(
        door_state.entities.get(EntityCategory::PartFamilies),
        ["Door_Outer_Left", "Door_Outer_Right"]
    );

    let bonnet_state = orchestrator.store().snapshot(bonnets.session_id).unwrap();
    assert_eq!(
        bonnet_state.entities.get(EntityCategory::PartFamilies),
        ["Bonnet_Outer"]
    );
}

#[tokio::test]
async fn expired_sessions_are_swept() {
    let session = SessionSettings {
        ttl_minutes: 0,
        ..Default::default()
    };
    let (orchestrator, _bus) = engine_with(one_row(), PipelineSettings::default(), session);

    orchestrator.handle_turn(None, "defect rate today").await.unwrap();
    assert_eq!(orchestrator.store().len(), 1);

    let removed = orchestrator.store().sweep_now();
    assert_eq!(removed, 1);
    assert!(orchestrator.store().is_empty());
}

#[tokio::test]
async fn removed_session_is_gone() {
    let (orchestrator, _bus) = engine(one_row());

    let output = orchestrator.handle_turn(None, "defect rate today").await.unwrap();
    let id = output.session_id;

    let info = orchestrator.store().info(id).expect("session should exist");
    assert_eq!(info.message_count, 2);
    assert_eq!(info.turns, 1);

    assert!(orchestrator.store().remove(id));
    assert!(orchestrator.store().info(id).is_none());
    assert!(!orchestrator.store().remove(id));
}
