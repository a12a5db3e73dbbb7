//! Test Utilities for the pobj Integration Suite
//!
//! Provides a fixture owning a fresh context plus a handful of object types
//! shared by the test files, and strict assertion helpers for heap
//! accounting.

#![allow(dead_code)]

use pobj::types::{kind::Long, Field, ObjectField, ObjectType};
use pobj::{HeapConfig, InvariantPolicy, PersistentContext, PersistentObject};
use std::sync::Arc;
use std::time::Duration;

/// Default heap size for tests (4MB)
pub const DEFAULT_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound for helper threads in locking tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// ============================================================================
/// HEAP FIXTURE
/// ============================================================================

/// Test fixture with a `Node { value: long, next: Node }` type registered
pub struct HeapFixture {
    pub ctx: Arc<PersistentContext>,
    pub node: Arc<ObjectType>,
    pub value: Field<Long>,
    pub next: ObjectField,
}

impl HeapFixture {
    /// Volatile heap with corrupted counts reported by panicking
    ///
    /// **Bug this finds:** Configuration validation bugs, initialization failures
    pub fn new() -> Self {
        Self::with_config(HeapConfig {
            heap_size: DEFAULT_HEAP_SIZE,
            invariant_policy: InvariantPolicy::Panic,
            ..Default::default()
        })
    }

    pub fn with_config(config: HeapConfig) -> Self {
        let ctx = PersistentContext::open(config)
            .expect("context should open with a valid configuration");

        let mut b = ObjectType::record("Node");
        let value = b.field::<Long>();
        let next = b.object_field(Some("Node"));
        let node = ctx
            .register_type(b.build())
            .expect("Node should register once");

        Self {
            ctx,
            node,
            value,
            next,
        }
    }

    /// Construct a node holding `value`
    pub fn node(&self, value: i64) -> Arc<PersistentObject> {
        let node = PersistentObject::new(&self.ctx, &self.node)
            .unwrap_or_else(|e| panic!("constructing Node failed: {:?}", e));
        node.set(self.value, value).expect("writing Node.value");
        node
    }

    /// Build a chain of `len` nodes; only the head keeps its creator reference
    pub fn chain(&self, len: usize) -> Arc<PersistentObject> {
        let head = self.node(0);
        let mut tail = Arc::clone(&head);
        for i in 1..len {
            let next = self.node(i as i64);
            tail.set_object_field(&self.next, Some(&next))
                .expect("linking chain");
            next.delete_reference().expect("handing next to its predecessor");
            tail = next;
        }
        head
    }

    pub fn live_blocks(&self) -> u64 {
        self.ctx.heap_stats().expect("heap stats").live_blocks
    }
}

/// ============================================================================
/// STRICT ASSERTION HELPERS
/// ============================================================================

/// Assert that the heap holds exactly `expected` live blocks
///
/// **Bug this finds:** Leaked type-name blocks, double frees, frees that
/// survived a rollback
#[track_caller]
pub fn assert_live_blocks(fixture: &HeapFixture, expected: u64, context: &str) {
    let actual = fixture.live_blocks();
    assert_eq!(
        actual, expected,
        "{}: heap holds {} live blocks, expected {} - reclamation leaked or double freed",
        context, actual, expected
    );
}

/// Assert that a representative was reclaimed and left the candidate set
#[track_caller]
pub fn assert_reclaimed(fixture: &HeapFixture, object: &Arc<PersistentObject>, context: &str) {
    assert!(
        object.is_freed(),
        "{}: {:?} should have been reclaimed",
        context,
        object
    );
    assert!(
        !fixture.ctx.candidates().contains(object.address()),
        "{}: reclaimed {:?} is still a cycle candidate",
        context,
        object
    );
}
