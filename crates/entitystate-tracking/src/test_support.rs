//! Shared fixtures for unit tests.
//!
//! The model:
//!
//! - `Customers` (`Id`, `Name`, complex `Address { Street, City, Geo { Lat } }`)
//! - `Orders` (`Id`, nullable `CustomerId`, `Total`)
//! - `Lines` (`Id`, non-nullable `OrderId`, `Qty`); deleting an order
//!   cascades to its lines
//! - `Employees` (`Id`, `Name`) with an independent self association
//!   `Employee_Manager` (`Manager` 0..1, `Reports` *)

use std::sync::Arc;

use entitystate_core::{
    AssociationEnd, AssociationSet, ComplexType, EntitySet, EntityType, MemberMetadata,
    MetadataWorkspace, Multiplicity, NavigationProperty, ReferentialConstraint,
};

use crate::entity::{ComplexObject, EntityObject};

pub(crate) fn geo_type() -> Arc<ComplexType> {
    Arc::new(ComplexType::new("Geo", vec![MemberMetadata::scalar("Lat")]))
}

pub(crate) fn address_type() -> Arc<ComplexType> {
    Arc::new(ComplexType::new(
        "Address",
        vec![
            MemberMetadata::scalar("Street"),
            MemberMetadata::scalar("City"),
            MemberMetadata::complex("Geo", geo_type()),
        ],
    ))
}

pub(crate) fn order_customer_workspace() -> Arc<MetadataWorkspace> {
    let customer = EntityType::new("Customer")
        .member(MemberMetadata::scalar("Id").key())
        .member(MemberMetadata::scalar("Name"))
        .member(MemberMetadata::complex("Address", address_type()))
        .navigation(NavigationProperty::new(
            "Orders",
            "Order_Customer",
            "Customer",
            "Order",
        ));
    let order = EntityType::new("Order")
        .member(MemberMetadata::scalar("Id").key())
        .member(MemberMetadata::scalar("CustomerId"))
        .member(MemberMetadata::scalar("Total"))
        .navigation(NavigationProperty::new(
            "Customer",
            "Order_Customer",
            "Order",
            "Customer",
        ))
        .navigation(NavigationProperty::new("Lines", "Line_Order", "Order", "Line"));
    let line = EntityType::new("Line")
        .member(MemberMetadata::scalar("Id").key())
        .member(MemberMetadata::scalar("OrderId").nullable(false))
        .member(MemberMetadata::scalar("Qty"))
        .navigation(NavigationProperty::new("Order", "Line_Order", "Line", "Order"));
    let employee = EntityType::new("Employee")
        .member(MemberMetadata::scalar("Id").key())
        .member(MemberMetadata::scalar("Name"))
        .navigation(NavigationProperty::new(
            "Manager",
            "Employee_Manager",
            "Report",
            "Manager",
        ))
        .navigation(NavigationProperty::new(
            "Reports",
            "Employee_Manager",
            "Manager",
            "Report",
        ));

    let mut ws = MetadataWorkspace::new();
    ws.add_entity_set(EntitySet::new("Customers", Arc::new(customer)))
        .unwrap();
    ws.add_entity_set(EntitySet::new("Orders", Arc::new(order)))
        .unwrap();
    ws.add_entity_set(EntitySet::new("Lines", Arc::new(line))).unwrap();
    ws.add_entity_set(EntitySet::new("Employees", Arc::new(employee)))
        .unwrap();
    ws.add_association(
        AssociationSet::new(
            "Order_Customer",
            AssociationEnd::new("Customer", "Customers", Multiplicity::ZeroOrOne),
            AssociationEnd::new("Order", "Orders", Multiplicity::Many),
        )
        .with_constraint(ReferentialConstraint::new(
            "Customer",
            "Order",
            &["Id"],
            &["CustomerId"],
        )),
    )
    .unwrap();
    ws.add_association(
        AssociationSet::new(
            "Line_Order",
            AssociationEnd::new("Order", "Orders", Multiplicity::One).cascade_delete(),
            AssociationEnd::new("Line", "Lines", Multiplicity::Many),
        )
        .with_constraint(ReferentialConstraint::new(
            "Order",
            "Line",
            &["Id"],
            &["OrderId"],
        )),
    )
    .unwrap();
    ws.add_association(AssociationSet::new(
        "Employee_Manager",
        AssociationEnd::new("Manager", "Employees", Multiplicity::ZeroOrOne),
        AssociationEnd::new("Report", "Employees", Multiplicity::Many),
    ))
    .unwrap();
    Arc::new(ws)
}

fn new_entity(ws: &MetadataWorkspace, set: &str) -> EntityObject {
    EntityObject::new(ws.entity_set(set).unwrap().element_type())
}

pub(crate) fn customer(ws: &MetadataWorkspace, id: i64, name: &str) -> EntityObject {
    new_entity(ws, "Customers").with("Id", id).with("Name", name)
}

pub(crate) fn order(ws: &MetadataWorkspace, id: i64, customer_id: Option<i64>) -> EntityObject {
    new_entity(ws, "Orders")
        .with("Id", id)
        .with("CustomerId", customer_id)
        .with("Total", 0_i64)
}

pub(crate) fn line(ws: &MetadataWorkspace, id: i64, order_id: i64) -> EntityObject {
    new_entity(ws, "Lines")
        .with("Id", id)
        .with("OrderId", order_id)
        .with("Qty", 1_i64)
}

pub(crate) fn employee(ws: &MetadataWorkspace, id: i64) -> EntityObject {
    new_entity(ws, "Employees")
        .with("Id", id)
        .with("Name", format!("E{}", id))
}

pub(crate) fn address(city: &str) -> ComplexObject {
    ComplexObject::new(&address_type())
        .with("Street", "Main")
        .with("City", city)
}
