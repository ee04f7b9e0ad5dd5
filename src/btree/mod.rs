//! Module `btree` implement an ordered index over fixed-size values.
//!
//! The index is a B+ tree: values live in leaves that form a doubly
//! linked list in key order, internal nodes carry separator keys.
//! Keys are not stored separately, they are derived from the values.
//! Cursors stay valid across arbitrary modifications of the tree; the
//! tree rewrites every registered cursor whenever nodes split, merge
//! or exchange values.
//!
//! Two flavours share one core. [RawTree] works on `&[u8]` values
//! with sizes and key derivation supplied at runtime. [Tree] wraps it
//! with compile-time types: anything implementing [TreeValue] can be
//! stored, and the [codec](crate::codec) fixes the on-disk layout.

use std::{cmp::Ordering, marker::PhantomData, rc::Rc};

use crate::{
    alloc::BlockAlloc,
    anchor::AnchorCell,
    codec::{self, Codec},
    engine::Engine,
    Result,
};

pub mod cursor;
pub mod loader;
pub mod node;
pub mod tree;

pub use cursor::RawCursor;
pub use loader::RawLoader;
pub use tree::{Anchor, RawTree, TreeDesc, MAX_KEY_SIZE};

/// Values storable in a typed [Tree]. The key must order values
/// totally; two values with equal keys are the same entry.
pub trait TreeValue: Codec + Clone {
    type Key: Codec + Ord;

    /// Derive the key under which this value is indexed.
    fn key(&self) -> Self::Key;
}

fn derive_key_fn<V: TreeValue>(value: &[u8], key: &mut [u8]) -> Result<()> {
    match V::decode(value) {
        Ok(value) => {
            value.key().encode(key);
            Ok(())
        }
        Err(err) => err_at!(Corruption, msg: "undecodable value in tree node: {}", err),
    }
}

fn key_cmp_fn<V: TreeValue>(a: &[u8], b: &[u8]) -> Ordering {
    match (V::Key::decode(a), V::Key::decode(b)) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b), // undecodable keys order by their raw bytes.
    }
}

/// Runtime descriptor for the raw core, monomorphized from `V`.
pub fn tree_desc<V: TreeValue>() -> TreeDesc {
    TreeDesc {
        value_size: V::SIZE,
        key_size: V::Key::SIZE,
        derive_key: derive_key_fn::<V>,
        key_cmp: key_cmp_fn::<V>,
    }
}

/// Statically typed ordered index over values of type `V`.
pub struct Tree<V> {
    raw: RawTree,
    _val: PhantomData<V>,
}

impl<V> Clone for Tree<V> {
    fn clone(&self) -> Tree<V> {
        Tree {
            raw: self.raw.clone(),
            _val: PhantomData,
        }
    }
}

impl<V: TreeValue> Tree<V> {
    /// Set up a fresh, empty tree and store its anchor through
    /// `cell`.
    pub fn create(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<Anchor>,
    ) -> Result<Tree<V>> {
        Ok(Tree {
            raw: RawTree::create(engine, alloc, cell, tree_desc::<V>())?,
            _val: PhantomData,
        })
    }

    /// Reconstruct a tree from its anchor.
    pub fn load(
        engine: Engine,
        alloc: Rc<dyn BlockAlloc>,
        cell: AnchorCell<Anchor>,
    ) -> Result<Tree<V>> {
        Ok(Tree {
            raw: RawTree::load(engine, alloc, cell, tree_desc::<V>())?,
            _val: PhantomData,
        })
    }

    pub fn as_raw(&self) -> &RawTree {
        &self.raw
    }

    /// Number of values in the tree.
    pub fn len(&self) -> u64 {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn height(&self) -> u32 {
        self.raw.height()
    }

    pub fn leaf_capacity(&self) -> usize {
        self.raw.leaf_capacity()
    }

    pub fn internal_max_children(&self) -> usize {
        self.raw.internal_max_children()
    }

    /// A fresh cursor, initially invalid.
    pub fn cursor(&self) -> Cursor<V> {
        Cursor {
            raw: self.raw.cursor(),
            _val: PhantomData,
        }
    }

    /// Cursor on the smallest key, invalid when empty.
    pub fn seek_min(&self) -> Result<Cursor<V>> {
        let cursor = self.cursor();
        cursor.raw.seek_min()?;
        Ok(cursor)
    }

    /// Cursor on the largest key, invalid when empty.
    pub fn seek_max(&self) -> Result<Cursor<V>> {
        let cursor = self.cursor();
        cursor.raw.seek_max()?;
        Ok(cursor)
    }

    /// Cursor on `key`, invalid when not present.
    pub fn find(&self, key: &V::Key) -> Result<Cursor<V>> {
        let cursor = self.cursor();
        cursor.raw.find(&codec::to_bytes(key))?;
        Ok(cursor)
    }

    /// Cursor on the first value with key >= `key`.
    pub fn lower_bound(&self, key: &V::Key) -> Result<Cursor<V>> {
        let cursor = self.cursor();
        cursor.raw.lower_bound(&codec::to_bytes(key))?;
        Ok(cursor)
    }

    /// Cursor on the first value with key > `key`.
    pub fn upper_bound(&self, key: &V::Key) -> Result<Cursor<V>> {
        let cursor = self.cursor();
        cursor.raw.upper_bound(&codec::to_bytes(key))?;
        Ok(cursor)
    }

    /// Insert `value`. Returns the cursor on the value with that key
    /// and whether a new entry was created.
    pub fn insert(&self, value: &V) -> Result<(Cursor<V>, bool)> {
        let cursor = self.cursor();
        let inserted = cursor.raw.insert(&codec::to_bytes(value))?;
        Ok((cursor, inserted))
    }

    /// Insert `value`, overwriting an existing entry with the same
    /// key. The flag is true when a new entry was created.
    pub fn insert_or_update(&self, value: &V) -> Result<(Cursor<V>, bool)> {
        let cursor = self.cursor();
        let inserted = cursor.raw.insert_or_update(&codec::to_bytes(value))?;
        Ok((cursor, inserted))
    }

    /// Erase the entry with `key`, if present.
    pub fn remove(&self, key: &V::Key) -> Result<bool> {
        let cursor = self.find(key)?;
        if cursor.is_valid() {
            cursor.erase()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Free every node and reset the tree to empty.
    pub fn clear(&self) -> Result<()> {
        self.raw.clear()
    }

    /// Walk the whole tree checking the structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.raw.validate()
    }

    /// Start bulk loading; the tree must be empty and the stream
    /// strictly increasing.
    pub fn bulk_load(&self) -> Result<Loader<V>> {
        Ok(Loader {
            raw: self.raw.bulk_load()?,
            _val: PhantomData,
        })
    }
}

/// Typed cursor over a [Tree].
pub struct Cursor<V> {
    raw: RawCursor,
    _val: PhantomData<V>,
}

impl<V: TreeValue> Cursor<V> {
    pub fn as_raw(&self) -> &RawCursor {
        &self.raw
    }

    pub fn is_valid(&self) -> bool {
        self.raw.is_valid()
    }

    pub fn is_erased(&self) -> bool {
        self.raw.is_erased()
    }

    pub fn seek_min(&self) -> Result<bool> {
        self.raw.seek_min()
    }

    pub fn seek_max(&self) -> Result<bool> {
        self.raw.seek_max()
    }

    pub fn find(&self, key: &V::Key) -> Result<bool> {
        self.raw.find(&codec::to_bytes(key))
    }

    pub fn lower_bound(&self, key: &V::Key) -> Result<bool> {
        self.raw.lower_bound(&codec::to_bytes(key))
    }

    pub fn upper_bound(&self, key: &V::Key) -> Result<bool> {
        self.raw.upper_bound(&codec::to_bytes(key))
    }

    pub fn move_next(&self) -> Result<bool> {
        self.raw.move_next()
    }

    pub fn move_prev(&self) -> Result<bool> {
        self.raw.move_prev()
    }

    pub fn get(&self) -> Result<V> {
        V::decode(&self.raw.get()?)
    }

    pub fn key(&self) -> Result<V::Key> {
        V::Key::decode(&self.raw.key()?)
    }

    pub fn set(&self, value: &V) -> Result<()> {
        self.raw.set(&codec::to_bytes(value))
    }

    pub fn insert(&self, value: &V) -> Result<bool> {
        self.raw.insert(&codec::to_bytes(value))
    }

    pub fn insert_or_update(&self, value: &V) -> Result<bool> {
        self.raw.insert_or_update(&codec::to_bytes(value))
    }

    pub fn erase(&self) -> Result<()> {
        self.raw.erase()
    }
}

/// Typed bulk loader over a [Tree].
pub struct Loader<V> {
    raw: RawLoader,
    _val: PhantomData<V>,
}

impl<V: TreeValue> Loader<V> {
    pub fn insert(&mut self, value: &V) -> Result<()> {
        self.raw.insert(&codec::to_bytes(value))
    }

    pub fn finish(self) -> Result<()> {
        self.raw.finish()
    }

    pub fn discard(self) -> Result<()> {
        self.raw.discard()
    }
}
