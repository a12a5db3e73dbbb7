//! Field Access Tests - Type-Checked Reads and Writes
//!
//! These tests verify that every accessor:
//! - stores and loads each scalar kind bit-exactly
//! - rejects a kind mismatch, an unknown index or a header field without
//!   side effects
//! - honours declared reference targets and the type hierarchy

mod common;

use common::HeapFixture;
use pobj::types::kind::{Boolean, Byte, Char, Double, Float, Int, Long, Short};
use pobj::types::{FieldType, ObjectField, ObjectType, ValueType};
use pobj::{PersistentObject, PobjError};
use quickcheck_macros::quickcheck;
use std::sync::Arc;

// ============================================================================
// SCALARS
// ============================================================================

/// Every scalar kind survives a store and load
///
/// **Bug this finds:** Offset overlap between fields, wrong widths
/// **Invariant verified:** Each field reads back exactly what was written
#[test]
fn test_all_scalar_kinds() {
    // Arrange
    let fixture = HeapFixture::new();
    let mut b = ObjectType::record("Sample");
    let flag = b.field::<Boolean>();
    let small = b.field::<Byte>();
    let letter = b.field::<Char>();
    let short = b.field::<Short>();
    let int = b.field::<Int>();
    let ratio = b.field::<Float>();
    let long = b.field::<Long>();
    let precise = b.field::<Double>();
    let ty = fixture.ctx.register_type(b.build()).unwrap();
    let sample = PersistentObject::new(&fixture.ctx, &ty).unwrap();

    // Act
    sample.set(flag, true).unwrap();
    sample.set(small, -7).unwrap();
    sample.set(letter, 'λ').unwrap();
    sample.set(short, -30_000).unwrap();
    sample.set(int, i32::MIN).unwrap();
    sample.set(ratio, 0.25).unwrap();
    sample.set(long, i64::MAX).unwrap();
    sample.set(precise, -1.0e300).unwrap();

    // Assert
    assert!(sample.get(flag).unwrap());
    assert_eq!(sample.get(small).unwrap(), -7);
    assert_eq!(sample.get(letter).unwrap(), 'λ');
    assert_eq!(sample.get(short).unwrap(), -30_000);
    assert_eq!(sample.get(int).unwrap(), i32::MIN);
    assert_eq!(sample.get(ratio).unwrap(), 0.25);
    assert_eq!(sample.get(long).unwrap(), i64::MAX);
    assert_eq!(sample.get(precise).unwrap(), -1.0e300);
}

/// New objects start with every user field zeroed
#[test]
fn test_fresh_object_is_zeroed() {
    let fixture = HeapFixture::new();
    let node = PersistentObject::new(&fixture.ctx, &fixture.node).unwrap();

    assert_eq!(node.get(fixture.value).unwrap(), 0);
    assert!(node.get_object_field(&fixture.next).unwrap().is_none());
    assert_eq!(node.version().unwrap(), 99);
    assert_eq!(node.ref_count().unwrap(), 1);
}

#[quickcheck]
fn prop_double_bits_preserved(bits: u64) -> bool {
    let fixture = HeapFixture::new();
    let mut b = ObjectType::record("Bits");
    let field = b.field::<Double>();
    let ty = fixture.ctx.register_type(b.build()).unwrap();
    let object = PersistentObject::new(&fixture.ctx, &ty).unwrap();

    object.set(field, f64::from_bits(bits)).unwrap();
    object.get(field).unwrap().to_bits() == bits
}

#[quickcheck]
fn prop_float_bits_preserved(bits: u32) -> bool {
    let fixture = HeapFixture::new();
    let mut b = ObjectType::record("Bits");
    let field = b.field::<Float>();
    let ty = fixture.ctx.register_type(b.build()).unwrap();
    let object = PersistentObject::new(&fixture.ctx, &ty).unwrap();

    object.set(field, f32::from_bits(bits)).unwrap();
    object.get(field).unwrap().to_bits() == bits
}

// ============================================================================
// REJECTED ACCESS
// ============================================================================

/// A kind mismatch fails and leaves the field untouched
///
/// **Bug this finds:** Unchecked reinterpretation of field bytes
#[test]
fn test_kind_mismatch_has_no_effect() {
    let fixture = HeapFixture::new();
    let node = fixture.node(41);
    let value_index = fixture.value.index();

    assert!(matches!(
        node.set_at::<Int>(value_index, 1),
        Err(PobjError::TypeMismatch { .. })
    ));
    assert!(matches!(
        node.get_at::<Double>(value_index),
        Err(PobjError::TypeMismatch { .. })
    ));
    assert_eq!(node.get(fixture.value).unwrap(), 41);
}

#[test]
fn test_index_out_of_bounds() {
    let fixture = HeapFixture::new();
    let node = fixture.node(0);

    assert!(matches!(
        node.get_at::<Long>(64),
        Err(PobjError::FieldIndexOutOfBounds { index: 64, .. })
    ));
}

/// Header fields are readable but never writable through accessors
///
/// **Bug this finds:** Reference counts or type names clobbered by user code
#[test]
fn test_header_fields_reserved() {
    let fixture = HeapFixture::new();
    let node = fixture.node(0);

    assert_eq!(node.get_at::<Int>(2).unwrap(), 1);
    assert!(matches!(
        node.set_at::<Int>(2, 5),
        Err(PobjError::ReservedField { index: 2 })
    ));
    assert_eq!(node.ref_count().unwrap(), 1);
}

#[test]
fn test_freed_object_rejects_access() {
    let fixture = HeapFixture::new();
    let node = fixture.node(3);
    node.delete_reference().unwrap();

    assert!(matches!(
        node.get(fixture.value),
        Err(PobjError::ObjectFreed { .. })
    ));
}

// ============================================================================
// REFERENCES
// ============================================================================

/// References to a subtype are accepted where the parent is declared
///
/// **Invariant verified:** Assignability follows the registered hierarchy
#[test]
fn test_subtype_reference_accepted() {
    let fixture = HeapFixture::new();
    let mut b = ObjectType::record_extending(&fixture.node, "TaggedNode");
    let tag = b.field::<Int>();
    let tagged_type = fixture.ctx.register_type(b.build()).unwrap();

    let head = fixture.node(1);
    let tagged = PersistentObject::new(&fixture.ctx, &tagged_type).unwrap();
    tagged.set(tag, 9).unwrap();
    tagged.set(fixture.value, 2).unwrap();

    head.set_object_field(&fixture.next, Some(&tagged)).unwrap();
    let loaded = head.get_object_field(&fixture.next).unwrap().unwrap();

    assert!(Arc::ptr_eq(&loaded, &tagged));
    assert_eq!(loaded.get(fixture.value).unwrap(), 2);
    assert_eq!(loaded.get(tag).unwrap(), 9);
}

#[test]
fn test_unrelated_reference_rejected() {
    let fixture = HeapFixture::new();
    let other_type = fixture
        .ctx
        .register_type(ObjectType::record("Stranger").build())
        .unwrap();

    let head = fixture.node(1);
    let stranger = PersistentObject::new(&fixture.ctx, &other_type).unwrap();

    assert!(matches!(
        head.set_object_field(&fixture.next, Some(&stranger)),
        Err(PobjError::TypeMismatch { .. })
    ));
    assert_eq!(stranger.ref_count().unwrap(), 1);
    assert!(head.get_object_field(&fixture.next).unwrap().is_none());
}

/// A handle asking for a more specific target than declared is refused
#[test]
fn test_narrowing_handle_rejected() {
    let fixture = HeapFixture::new();
    let mut b = ObjectType::record_extending(&fixture.node, "LeafNode");
    b.field::<Int>();
    fixture.ctx.register_type(b.build()).unwrap();

    let head = fixture.node(1);
    let narrowed = ObjectField::at(fixture.next.index(), Some("LeafNode"));
    let widened = ObjectField::at(fixture.next.index(), None);

    assert!(matches!(
        head.get_object_field(&narrowed),
        Err(PobjError::TypeMismatch { .. })
    ));
    assert!(head.get_object_field(&widened).unwrap().is_none());
}

// ============================================================================
// VALUES
// ============================================================================

#[test]
fn test_value_field_copies() {
    let fixture = HeapFixture::new();
    let mut vb = ValueType::builder("Span");
    let start = vb.field::<Long>();
    let end = vb.field::<Long>();
    let span = vb.build();

    let mut b = ObjectType::record("Interval");
    let range = b.value_field(&span);
    let label = b.field::<Char>();
    let ty = fixture.ctx.register_type(b.build()).unwrap();
    let interval = PersistentObject::new(&fixture.ctx, &ty).unwrap();

    let value = interval.get_value_field(&range).unwrap();
    value.set(start, 10).unwrap();
    value.set(end, 20).unwrap();
    interval.set_value_field(&range, &value).unwrap();
    interval.set(label, 'x').unwrap();

    let stored = interval.get_value_field(&range).unwrap();
    assert_eq!(stored.get(start).unwrap(), 10);
    assert_eq!(stored.get(end).unwrap(), 20);
    assert_eq!(interval.get(label).unwrap(), 'x');
}

#[test]
fn test_value_array_rejected() {
    let mut vb = ValueType::builder("Pixel");
    vb.field::<Int>();
    let pixel = vb.build();

    assert!(ObjectType::array("Pixel[]", FieldType::Value(pixel)).is_err());
}
