//! Property tests for relationship list bookkeeping and reject round trips.

mod common;

use common::{department, project, staff, tracker, workspace};
use entitystate::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Mentor(usize, usize),
    Unmentor(usize, usize),
    Lead(usize, usize),
    Unlead(usize, usize),
    DeleteStaff(usize),
    DetachStaff(usize),
    AcceptAll,
}

const STAFF: usize = 4;
const PROJECTS: usize = 3;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..STAFF, 0..STAFF).prop_map(|(a, b)| Op::Mentor(a, b)),
        2 => (0..STAFF, 0..STAFF).prop_map(|(a, b)| Op::Unmentor(a, b)),
        4 => (0..PROJECTS, 0..STAFF).prop_map(|(p, s)| Op::Lead(p, s)),
        2 => (0..PROJECTS, 0..STAFF).prop_map(|(p, s)| Op::Unlead(p, s)),
        1 => (0..STAFF).prop_map(Op::DeleteStaff),
        1 => (0..STAFF).prop_map(Op::DetachStaff),
        1 => Just(Op::AcceptAll),
    ]
}

fn check_lists(sm: &StateManager) -> std::result::Result<(), TestCaseError> {
    for entry in sm.entries() {
        let walked = sm.relationships_for(entry.id()).len();
        prop_assert_eq!(entry.relationship_count(), walked);
    }
    for rel in sm.relationships() {
        for key in rel.keys() {
            prop_assert!(sm.find_entry(key).is_some(), "dangling end {}", key);
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn relationship_lists_match_their_counts(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let ws = workspace();
        let mut sm = tracker(&ws);
        sm.attach("Departments", &department(&ws, 1, "Research")).unwrap();
        let staff_ids: Vec<EntryId> = (0..STAFF)
            .map(|i| sm.attach("Staff", &staff(&ws, i as i64 + 1, 1)).unwrap())
            .collect();
        let project_ids: Vec<EntryId> = (0..PROJECTS)
            .map(|i| sm.attach("Projects", &project(&ws, i as i64 + 100, None)).unwrap())
            .collect();
        check_lists(&sm)?;

        for op in ops {
            // Operations on entries that are gone or deleted fail; only the
            // bookkeeping afterwards matters here.
            let _ = match op {
                Op::Mentor(a, b) => sm.relate(staff_ids[a], "Mentor", staff_ids[b]).map(|_| ()),
                Op::Unmentor(a, b) => sm.unrelate(staff_ids[a], "Mentor", staff_ids[b]),
                Op::Lead(p, s) => sm.relate(project_ids[p], "Lead", staff_ids[s]).map(|_| ()),
                Op::Unlead(p, s) => sm.unrelate(project_ids[p], "Lead", staff_ids[s]),
                Op::DeleteStaff(s) => sm.delete(staff_ids[s]),
                Op::DetachStaff(s) => sm.detach(staff_ids[s]),
                Op::AcceptAll => sm.accept_all_changes(),
            };
            check_lists(&sm)?;
        }
    }

    #[test]
    fn reject_restores_scalar(budget in any::<i64>(), name in "[A-Za-z ]{0,12}") {
        let ws = workspace();
        let mut sm = tracker(&ws);
        let p = project(&ws, 1, None);
        let id = sm.attach("Projects", &p).unwrap();

        sm.set_current_value(id, "Budget", budget).unwrap();
        sm.reject_property_changes(id, "Budget").unwrap();
        prop_assert_eq!(p.scalar("Budget"), Some(Value::from(1_i64)));
        prop_assert_eq!(sm.state_of(id), EntityState::Unchanged);

        let s = staff(&ws, 5, 1);
        let staff_id = sm.attach("Staff", &s).unwrap();
        s.set("Name", name.as_str()).unwrap();
        sm.detect_changes().unwrap();
        sm.reject_property_changes(staff_id, "Name").unwrap();
        prop_assert_eq!(s.scalar("Name"), Some(Value::from("S5")));
        prop_assert_eq!(sm.state_of(staff_id), EntityState::Unchanged);
    }

    #[test]
    fn reject_restores_nested_complex_value(zip in any::<i64>()) {
        let ws = workspace();
        let mut sm = tracker(&ws);
        let d = department(&ws, 1, "Research");
        let id = sm.attach("Departments", &d).unwrap();

        sm.set_current_value(id, "Location.Zip", zip).unwrap();
        sm.reject_property_changes(id, "Location").unwrap();

        prop_assert_eq!(sm.current_value(id, "Location.Zip").unwrap(), Value::from(5_i64));
        prop_assert_eq!(sm.state_of(id), EntityState::Unchanged);
        prop_assert!(sm.modified_properties(id).unwrap().is_empty());
    }
}
