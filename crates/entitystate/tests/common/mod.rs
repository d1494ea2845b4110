//! Shared model for the integration tests.
//!
//! - `Departments` (`Id`, `Name`, complex `Location` and `Mailing`, both `Address { City, Zip }`)
//! - `Staff` (`Id`, non-nullable `DepartmentId`, `Name`); deleting a department cascades
//! - `Projects` (`Id`, nullable `LeadId`, `Budget`) led by a staff member
//! - `Staff_Mentor`: independent self association (`Mentor` 0..1, `Mentee` *)

#![allow(dead_code)]

use std::sync::Arc;

use entitystate::prelude::*;

pub fn address_type() -> Arc<ComplexType> {
    Arc::new(ComplexType::new(
        "Address",
        vec![MemberMetadata::scalar("City"), MemberMetadata::scalar("Zip")],
    ))
}

pub fn workspace() -> Arc<MetadataWorkspace> {
    let address = address_type();
    let department = EntityType::new("Department")
        .member(MemberMetadata::scalar("Id").key())
        .member(MemberMetadata::scalar("Name"))
        .member(MemberMetadata::complex("Location", Arc::clone(&address)))
        .member(MemberMetadata::complex("Mailing", address))
        .navigation(NavigationProperty::new(
            "Members",
            "Staff_Department",
            "Department",
            "Member",
        ));
    let staff = EntityType::new("Staff")
        .member(MemberMetadata::scalar("Id").key())
        .member(MemberMetadata::scalar("DepartmentId").nullable(false))
        .member(MemberMetadata::scalar("Name"))
        .navigation(NavigationProperty::new(
            "Department",
            "Staff_Department",
            "Member",
            "Department",
        ))
        .navigation(NavigationProperty::new("Projects", "Project_Lead", "Lead", "Project"))
        .navigation(NavigationProperty::new("Mentor", "Staff_Mentor", "Mentee", "Mentor"))
        .navigation(NavigationProperty::new("Mentees", "Staff_Mentor", "Mentor", "Mentee"));
    let project = EntityType::new("Project")
        .member(MemberMetadata::scalar("Id").key())
        .member(MemberMetadata::scalar("LeadId"))
        .member(MemberMetadata::scalar("Budget"))
        .navigation(NavigationProperty::new("Lead", "Project_Lead", "Project", "Lead"));

    let mut ws = MetadataWorkspace::new();
    ws.add_entity_set(EntitySet::new("Departments", Arc::new(department)))
        .unwrap();
    ws.add_entity_set(EntitySet::new("Staff", Arc::new(staff))).unwrap();
    ws.add_entity_set(EntitySet::new("Projects", Arc::new(project)))
        .unwrap();
    ws.add_association(
        AssociationSet::new(
            "Staff_Department",
            AssociationEnd::new("Department", "Departments", Multiplicity::One).cascade_delete(),
            AssociationEnd::new("Member", "Staff", Multiplicity::Many),
        )
        .with_constraint(ReferentialConstraint::new(
            "Department",
            "Member",
            &["Id"],
            &["DepartmentId"],
        )),
    )
    .unwrap();
    ws.add_association(
        AssociationSet::new(
            "Project_Lead",
            AssociationEnd::new("Lead", "Staff", Multiplicity::ZeroOrOne),
            AssociationEnd::new("Project", "Projects", Multiplicity::Many),
        )
        .with_constraint(ReferentialConstraint::new(
            "Lead",
            "Project",
            &["Id"],
            &["LeadId"],
        )),
    )
    .unwrap();
    ws.add_association(AssociationSet::new(
        "Staff_Mentor",
        AssociationEnd::new("Mentor", "Staff", Multiplicity::ZeroOrOne),
        AssociationEnd::new("Mentee", "Staff", Multiplicity::Many),
    ))
    .unwrap();
    Arc::new(ws)
}

fn new_entity(ws: &MetadataWorkspace, set: &str) -> EntityObject {
    EntityObject::new(ws.entity_set(set).unwrap().element_type())
}

pub fn address(city: &str, zip: i64) -> ComplexObject {
    ComplexObject::new(&address_type())
        .with("City", city)
        .with("Zip", zip)
}

pub fn department(ws: &MetadataWorkspace, id: i64, name: &str) -> EntityObject {
    let d = new_entity(ws, "Departments").with("Id", id).with("Name", name);
    d.set_complex("Location", Some(address("Oslo", 5))).unwrap();
    d.set_complex("Mailing", Some(address("Oslo", 5))).unwrap();
    d
}

pub fn staff(ws: &MetadataWorkspace, id: i64, department_id: i64) -> EntityObject {
    new_entity(ws, "Staff")
        .with("Id", id)
        .with("DepartmentId", department_id)
        .with("Name", format!("S{}", id))
}

pub fn project(ws: &MetadataWorkspace, id: i64, lead_id: Option<i64>) -> EntityObject {
    new_entity(ws, "Projects")
        .with("Id", id)
        .with("LeadId", lead_id)
        .with("Budget", 1_i64)
}

pub fn tracker(ws: &Arc<MetadataWorkspace>) -> StateManager {
    StateManager::new(Arc::clone(ws))
}
