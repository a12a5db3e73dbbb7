//! Cycle Tests - Candidate Handoff and Residual Discharge
//!
//! Reference counting cannot free orphaned cycles on its own. These tests
//! play the part of an external collector: they read the candidate set,
//! colour the members and discharge the references that come from inside
//! the cycle.

mod common;

use common::{assert_live_blocks, assert_reclaimed, HeapFixture};
use pobj::types::{ObjectField, ObjectType};
use pobj::{GcColor, PersistentObject, PobjError};
use std::sync::Arc;

/// Two nodes pointing at each other are freed by one discharge
///
/// **Bug this finds:** Worklist revisiting a member already scheduled
/// **Invariant verified:** Both blocks (and their type names) are released
#[test]
fn test_two_node_cycle() {
    // Arrange
    let fixture = HeapFixture::new();
    let baseline = fixture.live_blocks();
    let a = fixture.node(1);
    let b = fixture.node(2);
    a.set_object_field(&fixture.next, Some(&b)).unwrap();
    b.set_object_field(&fixture.next, Some(&a)).unwrap();

    // Act: drop the creator references; the cycle is now orphaned
    a.delete_reference().unwrap();
    b.delete_reference().unwrap();

    // Assert
    assert!(!a.is_freed() && !b.is_freed());
    assert_eq!(a.ref_count().unwrap(), 1);
    assert_eq!(b.ref_count().unwrap(), 1);
    let candidates = fixture.ctx.candidates().snapshot();
    assert!(candidates.contains(&a.address()));
    assert!(candidates.contains(&b.address()));

    // Act: collector discharges the one internal reference to `a`
    a.set_color(GcColor::White).unwrap();
    b.set_color(GcColor::White).unwrap();
    fixture
        .ctx
        .delete_residual_references(a.address(), 1)
        .unwrap();

    // Assert
    assert_reclaimed(&fixture, &a, "cycle member a");
    assert_reclaimed(&fixture, &b, "cycle member b");
    assert_live_blocks(&fixture, baseline, "after discharging the cycle");
}

#[test]
fn test_self_loop() {
    let fixture = HeapFixture::new();
    let baseline = fixture.live_blocks();
    let node = fixture.node(7);

    node.set_object_field(&fixture.next, Some(&node)).unwrap();
    node.delete_reference().unwrap();
    assert_eq!(node.ref_count().unwrap(), 1);

    node.delete_residual_references(1).unwrap();

    assert_reclaimed(&fixture, &node, "self loop");
    assert_live_blocks(&fixture, baseline, "after discharging the self loop");
}

/// A member referenced twice from inside the cycle needs a count of two
#[test]
fn test_multiple_internal_references() {
    let fixture = HeapFixture::new();
    let mut pb = ObjectType::record("Pair");
    let left = pb.object_field(Some("Pair"));
    let right = pb.object_field(Some("Pair"));
    let pair_type = fixture.ctx.register_type(pb.build()).unwrap();
    let baseline = fixture.live_blocks();

    let a = PersistentObject::new(&fixture.ctx, &pair_type).unwrap();
    let b = PersistentObject::new(&fixture.ctx, &pair_type).unwrap();
    b.set_object_field(&left, Some(&a)).unwrap();
    b.set_object_field(&right, Some(&a)).unwrap();
    a.set_object_field(&left, Some(&b)).unwrap();
    a.delete_reference().unwrap();
    b.delete_reference().unwrap();
    assert_eq!(a.ref_count().unwrap(), 2);

    a.delete_residual_references(2).unwrap();

    assert_reclaimed(&fixture, &a, "pair a");
    assert_reclaimed(&fixture, &b, "pair b");
    assert_live_blocks(&fixture, baseline, "after discharging the pair");
}

/// An externally rooted cycle loses only the discharged references
#[test]
fn test_discharge_keeps_externally_referenced_member() {
    let fixture = HeapFixture::new();
    let a = fixture.node(1);
    let b = fixture.node(2);
    a.set_object_field(&fixture.next, Some(&b)).unwrap();
    b.set_object_field(&fixture.next, Some(&a)).unwrap();
    b.delete_reference().unwrap();
    // `a` keeps its creator reference plus the one from `b`
    assert_eq!(a.ref_count().unwrap(), 2);

    a.delete_residual_references(1).unwrap();

    assert!(!a.is_freed());
    assert_eq!(a.ref_count().unwrap(), 1);
    assert!(fixture.ctx.candidates().contains(a.address()));
}

#[test]
fn test_zero_residual_rejected() {
    let fixture = HeapFixture::new();
    let node = fixture.node(0);

    assert!(matches!(
        node.delete_residual_references(0),
        Err(PobjError::InvalidArgument(_))
    ));
    assert_eq!(node.ref_count().unwrap(), 1);
}

/// Discharging more references than exist is a fatal invariant violation
#[test]
fn test_excess_residual_panics_and_rolls_back() {
    let fixture = HeapFixture::new();
    let node = fixture.node(0);
    let target = Arc::clone(&node);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = target.delete_residual_references(3);
    }));

    assert!(outcome.is_err());
    assert_eq!(node.ref_count().unwrap(), 1);
    assert!(!node.monitor().is_locked());
}

/// The candidate set is cleared of freed members even when a collector
/// never looks at it
#[test]
fn test_candidates_forget_freed_objects() {
    let fixture = HeapFixture::new();
    let node = fixture.node(0);
    node.add_reference().unwrap();
    node.delete_reference().unwrap();
    assert!(fixture.ctx.candidates().contains(node.address()));

    node.delete_reference().unwrap();
    assert!(!fixture.ctx.candidates().contains(node.address()));
    assert!(fixture.ctx.candidates().is_empty());

    let untyped = ObjectField::at(fixture.next.index(), None);
    assert!(matches!(
        node.get_object_field(&untyped),
        Err(PobjError::ObjectFreed { .. })
    ));
}
