//! Cursors over a raw B+ tree.
//!
//! A cursor is registered with its tree on creation and unregistered
//! when dropped; in between, the tree rewrites the cursor's path
//! whenever structure changes, so the cursor keeps pointing at the
//! same logical value across splits, merges and steals. Erasing the
//! value under a cursor leaves the cursor in an "erased" state from
//! which next/prev moves transparently continue.

use std::{cell::RefCell, rc::Rc};

use crate::{
    btree::tree::{CursorState, RawTree, SeekBound, TreeInner, DELETED, INVALID},
    Result,
};

/// Live pointer into a [RawTree].
pub struct RawCursor {
    tree: Rc<RefCell<TreeInner>>,
    state: Rc<RefCell<CursorState>>,
}

impl RawTree {
    /// A fresh cursor, initially invalid. Seek it somewhere.
    pub fn cursor(&self) -> RawCursor {
        let state = Rc::new(RefCell::new(CursorState::new_invalid()));
        self.inner.borrow_mut().register_cursor(&state);
        RawCursor {
            tree: Rc::clone(&self.inner),
            state,
        }
    }
}

impl RawCursor {
    /// False once the cursor moved past the ends of the tree or was
    /// otherwise invalidated.
    pub fn is_valid(&self) -> bool {
        self.state.borrow().flags & INVALID == 0
    }

    /// True if the value under the cursor was erased; the next
    /// [RawCursor::move_next] or [RawCursor::move_prev] resumes from
    /// the erased position.
    pub fn is_erased(&self) -> bool {
        self.state.borrow().flags & DELETED != 0
    }

    /// Position on the smallest key. False when the tree is empty.
    pub fn seek_min(&self) -> Result<bool> {
        self.tree.borrow_mut().seek_min(&self.state)
    }

    /// Position on the largest key. False when the tree is empty.
    pub fn seek_max(&self) -> Result<bool> {
        self.tree.borrow_mut().seek_max(&self.state)
    }

    /// Position on `key`. False (and invalid) when not present.
    pub fn find(&self, key: &[u8]) -> Result<bool> {
        self.tree.borrow_mut().find(key, &self.state)?;
        Ok(self.is_valid())
    }

    /// Position on the first value with key >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> Result<bool> {
        self.tree.borrow_mut().seek_bound(SeekBound::Lower, key, &self.state)?;
        Ok(self.is_valid())
    }

    /// Position on the first value with key > `key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<bool> {
        self.tree.borrow_mut().seek_bound(SeekBound::Upper, key, &self.state)?;
        Ok(self.is_valid())
    }

    /// Move to the next value in key order. False at the end.
    pub fn move_next(&self) -> Result<bool> {
        self.tree.borrow_mut().move_next(&self.state)
    }

    /// Move to the previous value in key order. False at the start.
    pub fn move_prev(&self) -> Result<bool> {
        self.tree.borrow_mut().move_prev(&self.state)
    }

    /// Copy of the current value.
    pub fn get(&self) -> Result<Vec<u8>> {
        self.tree.borrow_mut().cursor_get(&self.state)
    }

    /// Derived key of the current value.
    pub fn key(&self) -> Result<Vec<u8>> {
        let value = self.get()?;
        let tree = self.tree.borrow();
        let key = tree.key_of(&value)?;
        Ok(key[..tree.desc.key_size].to_vec())
    }

    /// Overwrite the current value; the new value must derive the
    /// same key.
    pub fn set(&self, value: &[u8]) -> Result<()> {
        self.tree.borrow_mut().cursor_set(&self.state, value)
    }

    /// Insert `value`, leaving the cursor on the (old or new) value
    /// with that key. False when an equal key already existed.
    pub fn insert(&self, value: &[u8]) -> Result<bool> {
        self.tree.borrow_mut().insert(value, false, &self.state)
    }

    /// Insert `value`, overwriting an existing value with an equal
    /// key. False when it overwrote.
    pub fn insert_or_update(&self, value: &[u8]) -> Result<bool> {
        self.tree.borrow_mut().insert(value, true, &self.state)
    }

    /// Erase the value under the cursor.
    pub fn erase(&self) -> Result<()> {
        self.tree.borrow_mut().erase(&self.state)
    }
}
