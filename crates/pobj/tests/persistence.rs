//! Persistence Tests - File-Backed Heaps Across Contexts
//!
//! These tests verify that a heap file keeps its root, objects and reference
//! counts when reopened by a fresh context, that an image captured in the
//! middle of a transaction reopens without that transaction's effects, and
//! that files which are not heaps are refused.

use anyhow::Context as _;
use pobj::heap::Journal;
use pobj::logging::{recent_events, ObjectEvent};
use pobj::types::{kind::Long, Field, ObjectField, ObjectType};
use pobj::{HeapConfig, InvariantPolicy, PersistentContext, PersistentObject, PobjError};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const HEAP_SIZE: usize = 1024 * 1024;

struct Schema {
    node: Arc<ObjectType>,
    value: Field<Long>,
    next: ObjectField,
}

fn open(dir: &TempDir) -> anyhow::Result<(Arc<PersistentContext>, Schema)> {
    open_at(&dir.path().join("objects.heap"))
}

fn open_at(path: &Path) -> anyhow::Result<(Arc<PersistentContext>, Schema)> {
    let ctx = PersistentContext::open(HeapConfig {
        path: Some(path.to_path_buf()),
        heap_size: HEAP_SIZE,
        invariant_policy: InvariantPolicy::Panic,
        ..Default::default()
    })
    .with_context(|| format!("opening {}", path.display()))?;

    let mut b = ObjectType::record("Node");
    let value = b.field::<Long>();
    let next = b.object_field(Some("Node"));
    let node = ctx.register_type(b.build())?;
    Ok((ctx, Schema { node, value, next }))
}

/// The root and everything reachable from it survive a reopen
///
/// **Bug this finds:** Unflushed commits, type names not resolvable on reload
/// **Invariant verified:** Values and counts read back unchanged
#[test]
fn test_root_survives_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;

    let (head_address, live_blocks) = {
        let (ctx, schema) = open(&dir)?;
        let head = PersistentObject::new(&ctx, &schema.node)?;
        let tail = PersistentObject::new(&ctx, &schema.node)?;
        head.set(schema.value, 10)?;
        tail.set(schema.value, 20)?;
        head.set_object_field(&schema.next, Some(&tail))?;
        tail.delete_reference()?;
        ctx.set_root(Some(&head))?;
        head.delete_reference()?;

        let live_blocks = ctx.heap_stats()?.live_blocks;
        ctx.close()?;
        (head.address(), live_blocks)
    };

    let (ctx, schema) = open(&dir)?;
    assert_eq!(ctx.heap_stats()?.live_blocks, live_blocks);
    assert!(ctx.heap().recovery().is_empty());

    let head = ctx.root()?.context("root should persist")?;
    assert_eq!(head.address(), head_address);
    assert_eq!(head.type_name(), "Node");
    assert_eq!(head.stored_type_name()?, "Node");
    assert_eq!(head.get(schema.value)?, 10);
    assert_eq!(head.ref_count()?, 1);

    let tail = head
        .get_object_field(&schema.next)?
        .context("tail should persist")?;
    assert_eq!(tail.get(schema.value)?, 20);
    assert_eq!(tail.ref_count()?, 1);
    Ok(())
}

/// Clearing the root in a later session reclaims the persisted graph
#[test]
fn test_reclaim_after_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let baseline = {
        let (ctx, schema) = open(&dir)?;
        let baseline = ctx.heap_stats()?.live_blocks;
        let head = PersistentObject::new(&ctx, &schema.node)?;
        ctx.set_root(Some(&head))?;
        head.delete_reference()?;
        baseline
    };

    let (ctx, _) = open(&dir)?;
    let head = ctx.root()?.context("root should persist")?;
    ctx.set_root(None)?;

    assert!(head.is_freed());
    assert_eq!(ctx.heap_stats()?.live_blocks, baseline);
    Ok(())
}

/// A type that was never registered in this session cannot be resolved
#[test]
fn test_unregistered_type_on_reload() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let (ctx, _) = open(&dir)?;
        let ty = ctx.register_type(ObjectType::record("Ghost").build())?;
        let ghost = PersistentObject::new(&ctx, &ty)?;
        ctx.set_root(Some(&ghost))?;
    }

    let (ctx, _) = open(&dir)?;
    assert!(matches!(ctx.root(), Err(PobjError::UnknownType(_))));
    Ok(())
}

#[test]
fn test_foreign_file_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("not-a-heap");
    std::fs::write(&path, vec![0xAB; HEAP_SIZE])?;

    let result = PersistentContext::open(HeapConfig {
        path: Some(path),
        heap_size: HEAP_SIZE,
        ..Default::default()
    });
    assert!(matches!(result, Err(PobjError::CorruptHeap(_))));
    Ok(())
}

/// A rolled-back write never reaches the file
#[test]
fn test_rolled_back_write_not_persisted() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let (ctx, schema) = open(&dir)?;
        let head = PersistentObject::new(&ctx, &schema.node)?;
        head.set(schema.value, 1)?;
        ctx.set_root(Some(&head))?;

        let result: pobj::Result<()> = ctx.transaction(&[&head], || {
            head.set(schema.value, 2)?;
            Err(PobjError::InvalidArgument("discard".to_string()))
        });
        assert!(result.is_err());
    }

    let (ctx, schema) = open(&dir)?;
    let head = ctx.root()?.context("root should persist")?;
    assert_eq!(head.get(schema.value)?, 1);
    Ok(())
}

/// An image captured while a transaction is in flight reopens as if the
/// transaction never ran
///
/// The heap is flushed mid-transaction and copied together with its journal,
/// which is what a power loss leaves behind after the OS wrote the dirty pages
/// back.
///
/// **Bug this finds:** Uncommitted bytes surviving a crash
/// **Invariant verified:** A transaction is all or none across a crash
#[test]
fn test_crash_image_rolls_back_in_flight_transaction() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let heap_path = dir.path().join("objects.heap");
    let image = dir.path().join("crashed.heap");

    let live_blocks = {
        let (ctx, schema) = open_at(&heap_path)?;
        let head = PersistentObject::new(&ctx, &schema.node)?;
        head.set(schema.value, 100)?;
        ctx.set_root(Some(&head))?;
        head.delete_reference()?;
        let live_blocks = ctx.heap_stats()?.live_blocks;

        let result: pobj::Result<()> = ctx.transaction(&[&head], || {
            head.set(schema.value, 0)?;
            let tail = PersistentObject::new(&ctx, &schema.node)?;
            head.set_object_field(&schema.next, Some(&tail))?;
            tail.delete_reference()?;

            ctx.heap().flush()?;
            std::fs::copy(&heap_path, &image)?;
            std::fs::copy(Journal::path_for(&heap_path), Journal::path_for(&image))?;
            Err(PobjError::InvalidArgument("power lost".to_string()))
        });
        assert!(result.is_err());
        live_blocks
    };

    let (ctx, schema) = open_at(&image)?;
    let recovery = ctx.heap().recovery();
    assert_eq!(recovery.transactions, 1);
    assert!(recovery.restored_ranges >= 1);
    assert_eq!(recovery.released_blocks, 2);

    let head = ctx.root()?.context("root should persist")?;
    assert_eq!(head.get(schema.value)?, 100);
    assert!(head.get_object_field(&schema.next)?.is_none());
    assert_eq!(head.ref_count()?, 1);
    assert_eq!(ctx.heap_stats()?.live_blocks, live_blocks);

    let journal = ctx.heap().journal().context("file heaps keep a journal")?;
    assert!(journal.is_empty()?);

    let image_name = image.display().to_string();
    assert!(recent_events().iter().any(|event| matches!(
        event,
        ObjectEvent::JournalRecovered { path, transactions: 1, .. } if *path == image_name
    )));
    Ok(())
}

/// Committed and rolled-back transactions leave nothing to replay
#[test]
fn test_journal_empty_between_transactions() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let (ctx, schema) = open(&dir)?;
    let journal = ctx.heap().journal().context("file heaps keep a journal")?;
    assert!(journal.path().exists());

    let head = PersistentObject::new(&ctx, &schema.node)?;
    head.set(schema.value, 7)?;
    assert!(journal.is_empty()?);

    let result: pobj::Result<()> = ctx.transaction(&[&head], || {
        head.set(schema.value, 8)?;
        assert!(!journal.is_empty()?);
        Err(PobjError::InvalidArgument("discard".to_string()))
    });
    assert!(result.is_err());
    assert!(journal.is_empty()?);
    assert_eq!(head.get(schema.value)?, 7);
    Ok(())
}
