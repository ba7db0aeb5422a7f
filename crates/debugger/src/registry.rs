//! Ordered tables backing the breakpoint, stack and thread views
//!
//! A table may end with a synthetic "more" row when the backend has more
//! items than were fetched. Mutations return [`TableChange`]s describing the
//! rows an observer has to refresh.
use crate::types::{Breakpoint, StackFrame, Thread};

/// Something stored in a [`Table`]; equality is row identity
pub trait Row: Clone + PartialEq {
    /// Index selected after the rows are replaced wholesale
    fn preferred_current(_rows: &[Self]) -> usize {
        0
    }
}

impl Row for Breakpoint {}

impl Row for Thread {}

impl Row for StackFrame {
    /// The first frame with source on disk, else the innermost frame
    fn preferred_current(rows: &[Self]) -> usize {
        rows.iter().position(StackFrame::file_exists).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableChange {
    Reset,
    Inserted(usize),
    Removed(usize),
    Updated(usize),
}

#[derive(Debug, Clone)]
pub struct Table<T> {
    rows: Vec<T>,
    can_expand: bool,
    current: usize,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            can_expand: false,
            current: 0,
        }
    }
}

impl<T: Row> Table<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every row at once
    pub fn set_all(&mut self, rows: Vec<T>, can_expand: bool) -> TableChange {
        self.current = T::preferred_current(&rows);
        self.rows = rows;
        self.can_expand = can_expand;
        TableChange::Reset
    }

    pub fn clear(&mut self) -> TableChange {
        self.set_all(Vec::new(), false)
    }

    /// Add a row, or replace the row with the same identity.
    pub fn insert(&mut self, row: T) -> TableChange {
        match self.position(&row) {
            Some(index) => {
                self.rows[index] = row;
                TableChange::Updated(index)
            }
            None => {
                self.rows.push(row);
                TableChange::Inserted(self.rows.len() - 1)
            }
        }
    }

    /// Removing a row that is not present does nothing.
    pub fn remove(&mut self, row: &T) -> Option<TableChange> {
        let index = self.position(row)?;
        self.rows.remove(index);
        if self.current >= self.rows.len() {
            self.current = self.rows.len().saturating_sub(1);
        }
        Some(TableChange::Removed(index))
    }

    /// Replace the row with the same identity. Reports a change even when
    /// nothing differs.
    pub fn update(&mut self, row: T) -> Option<TableChange> {
        let index = self.position(&row)?;
        self.rows[index] = row;
        Some(TableChange::Updated(index))
    }

    /// Edit the row with the same identity as `key` in place.
    pub fn update_with(&mut self, key: &T, f: impl FnOnce(&mut T)) -> Option<TableChange> {
        let index = self.position(key)?;
        f(&mut self.rows[index]);
        Some(TableChange::Updated(index))
    }

    /// Returns the old and new rows, or nothing when the index is unchanged
    /// or out of range.
    pub fn set_current_index(&mut self, index: usize) -> Vec<TableChange> {
        if index == self.current || index >= self.rows.len() {
            return Vec::new();
        }
        let old = std::mem::replace(&mut self.current, index);
        vec![TableChange::Updated(old), TableChange::Updated(index)]
    }

    pub fn position(&self, row: &T) -> Option<usize> {
        self.rows.iter().position(|r| r == row)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.rows.get(index)
    }

    pub fn find(&self, row: &T) -> Option<&T> {
        self.rows.iter().find(|r| *r == row)
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.rows.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.rows.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn can_expand(&self) -> bool {
        self.can_expand
    }

    /// Rows including the "more" row
    pub fn row_count(&self) -> usize {
        self.rows.len() + usize::from(self.can_expand)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> Option<&T> {
        self.rows.get(self.current)
    }
}
