//! Lifecycle and property tracking through the public API.

mod common;

use common::{address, department, project, staff, tracker, workspace};
use entitystate::prelude::*;

#[test]
fn set_modified_property_records_single_change() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let p = project(&ws, 1, None);
    let id = sm.attach("Projects", &p).unwrap();

    sm.set_modified_property(id, "Budget").unwrap();

    assert_eq!(sm.state_of(id), EntityState::Modified);
    assert_eq!(sm.modified_properties(id).unwrap(), vec!["Budget".to_string()]);
    assert_eq!(sm.original_value(id, "Budget").unwrap(), Value::from(1_i64));
}

#[test]
fn deleting_added_entry_detaches_it() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let p = project(&ws, 1, None);
    let id = sm.add_object("Projects", &p).unwrap();
    assert!(sm.entry(id).unwrap().key().is_temporary());

    sm.change_state(id, EntityState::Deleted).unwrap();

    assert_eq!(sm.state_of(id), EntityState::Detached);
    assert!(sm.entry(id).is_none());
    assert!(sm.entry_for(&p).is_none());
    assert!(p.entity_key().is_none());
}

#[test]
fn detaching_principal_leaves_key_entry() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let d = department(&ws, 1, "Research");
    let s = staff(&ws, 10, 1);
    let dept_id = sm.attach("Departments", &d).unwrap();
    let staff_id = sm.attach("Staff", &s).unwrap();
    let key = sm.entry(dept_id).unwrap().key().clone();

    sm.detach(dept_id).unwrap();

    let stub = sm.entry(dept_id).unwrap();
    assert!(stub.is_key_entry());
    assert_eq!(stub.state(), EntityState::Unchanged);
    assert_eq!(sm.find_entry(&key), Some(dept_id));
    assert!(sm.entry_for(&d).is_none());
    assert_eq!(sm.related(staff_id, "Department").unwrap(), vec![dept_id]);
    let rels = sm.relationships_for(staff_id);
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].key(0), &key);
    assert!(s.reference("Department").is_none());
    assert_eq!(s.detached_key("Department"), Some(key));
    assert_eq!(s.scalar("DepartmentId"), Some(Value::from(1_i64)));
}

#[test]
fn complex_swap_reports_container_and_leaf() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let d = department(&ws, 1, "Research");
    let id = sm.attach("Departments", &d).unwrap();

    d.set_complex("Location", Some(address("Oslo", 7))).unwrap();
    let report = sm.detect_changes().unwrap();
    let paths: Vec<&str> = report
        .property_changes
        .iter()
        .map(|c| c.property.as_str())
        .collect();
    assert!(paths.contains(&"Location"));
    assert!(paths.contains(&"Location.Zip"));
    assert!(!paths.contains(&"Location.City"));
    assert_eq!(sm.original_value(id, "Location.Zip").unwrap(), Value::from(5_i64));
    assert_eq!(sm.current_value(id, "Location.Zip").unwrap(), Value::from(7_i64));

    // The snapshot now follows the new instance: no second swap.
    let again = sm.detect_changes().unwrap();
    assert!(again.property_changes.iter().all(|c| c.property != "Location"));
}

#[test]
fn untouched_nan_member_stays_unchanged() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let p = project(&ws, 1, None).with("Budget", f64::NAN);
    let id = sm.attach("Projects", &p).unwrap();

    let report = sm.detect_changes().unwrap();
    assert!(report.is_empty());
    assert_eq!(sm.state_of(id), EntityState::Unchanged);
    assert!(!sm.is_property_changed(id, "Budget").unwrap());

    // Writing NaN over NaN is not a change either.
    sm.set_current_value(id, "Budget", f64::NAN).unwrap();
    assert_eq!(sm.state_of(id), EntityState::Unchanged);

    p.set("Budget", 2.5_f64).unwrap();
    let report = sm.detect_changes().unwrap();
    assert!(report.property_changes.iter().any(|c| c.property == "Budget"));
    assert_eq!(sm.state_of(id), EntityState::Modified);
}

#[test]
fn key_entry_rejects_property_changes() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let key = EntityKey::single("Departments", "Id", 3_i64).unwrap();
    let stub = sm.add_key_entry(&key).unwrap();

    let err = sm.set_modified_property(stub, "Name").unwrap_err();
    assert!(err.is_invalid_operation());
    assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::KeyEntry));
}

#[test]
fn modified_fields_follow_state() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let id = sm.attach("Projects", &project(&ws, 1, None)).unwrap();
    assert!(sm.entry(id).unwrap().modified_fields().is_none());

    sm.set_current_value(id, "Budget", 5_i64).unwrap();
    assert!(sm.entry(id).unwrap().modified_fields().is_some());

    sm.delete(id).unwrap();
    assert_eq!(sm.state_of(id), EntityState::Deleted);
    assert!(sm.entry(id).unwrap().modified_fields().is_some());

    sm.accept_changes(id).unwrap();
    assert!(sm.entry(id).is_none());
}

#[test]
fn reject_after_set_modified_property_restores_unchanged() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let p = project(&ws, 1, None);
    let id = sm.attach("Projects", &p).unwrap();

    sm.set_current_value(id, "Budget", 40_i64).unwrap();
    sm.set_modified_property(id, "Budget").unwrap();
    sm.reject_property_changes(id, "Budget").unwrap();

    assert_eq!(p.scalar("Budget"), Some(Value::from(1_i64)));
    assert_eq!(sm.state_of(id), EntityState::Unchanged);
    assert!(sm.modified_properties(id).unwrap().is_empty());
}

#[test]
fn accept_changes_twice_on_unchanged_is_noop() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let id = sm.attach("Projects", &project(&ws, 1, None)).unwrap();
    let before = serde_json::to_value(sm.snapshot()).unwrap();

    sm.accept_changes(id).unwrap();
    sm.accept_changes(id).unwrap();

    assert_eq!(sm.state_of(id), EntityState::Unchanged);
    assert_eq!(serde_json::to_value(sm.snapshot()).unwrap(), before);
}

#[test]
fn set_modified_all_then_reject_each_property() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let id = sm.attach("Departments", &department(&ws, 1, "Research")).unwrap();

    sm.set_modified_all(id).unwrap();
    assert_eq!(sm.state_of(id), EntityState::Modified);
    for name in ["Name", "Location", "Mailing"] {
        sm.reject_property_changes(id, name).unwrap();
    }

    assert_eq!(sm.state_of(id), EntityState::Unchanged);
    assert!(
        sm.entry(id)
            .unwrap()
            .modified_fields()
            .is_none_or(|bits| bits.count() == 0)
    );
}

#[test]
fn complex_object_shared_by_two_members_is_rejected() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let d = department(&ws, 1, "Research");
    sm.attach("Departments", &d).unwrap();

    let shared = d.complex("Location").unwrap();
    d.set_complex("Mailing", Some(shared)).unwrap();
    let err = sm.detect_changes().unwrap_err();
    assert_eq!(
        err.invalid_operation_kind(),
        Some(InvalidOperationKind::DuplicateComplexObject)
    );
}

#[test]
fn state_table_round_trip() {
    let ws = workspace();
    let mut sm = tracker(&ws);
    let p = project(&ws, 1, None);
    let id = sm.attach("Projects", &p).unwrap();

    sm.change_state(id, EntityState::Modified).unwrap();
    assert_eq!(
        sm.modified_properties(id).unwrap(),
        vec!["LeadId".to_string(), "Budget".to_string()]
    );
    sm.change_state(id, EntityState::Unchanged).unwrap();
    assert_eq!(sm.state_of(id), EntityState::Unchanged);
    assert!(sm.entry(id).unwrap().modified_fields().is_none());

    sm.change_state(id, EntityState::Added).unwrap();
    assert!(sm.entry(id).unwrap().key().is_temporary());
    sm.accept_changes(id).unwrap();
    assert!(sm.entry(id).unwrap().key().is_permanent());

    sm.change_state(id, EntityState::Deleted).unwrap();
    sm.change_state(id, EntityState::Unchanged).unwrap();
    assert_eq!(sm.state_of(id), EntityState::Unchanged);

    sm.change_state(id, EntityState::Detached).unwrap();
    assert_eq!(sm.state_of(id), EntityState::Detached);
    let err = sm.change_state(id, EntityState::Modified).unwrap_err();
    assert_eq!(err.invalid_operation_kind(), Some(InvalidOperationKind::Detached));
}

#[test]
fn state_changes_are_reported() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let ws = workspace();
    let mut sm = tracker(&ws);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    sm.events_mut()
        .on_state_changed(move |change| sink.borrow_mut().push((change.from, change.to)));

    let id = sm.attach("Projects", &project(&ws, 1, None)).unwrap();
    sm.set_current_value(id, "Budget", 9_i64).unwrap();
    sm.accept_changes(id).unwrap();

    let seen = seen.borrow();
    assert!(seen.contains(&(EntityState::Unchanged, EntityState::Modified)));
    assert!(seen.contains(&(EntityState::Modified, EntityState::Unchanged)));
}
