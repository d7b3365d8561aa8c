// Copyright 2020 Joyent, Inc.

//! Tables of homogeneous rows.

use std::sync::Arc;

use crate::error::{HapiError, Result};
use crate::item_group::{ItemGroup, ItemGroupPtr, ItemGroupType};

pub type ItemTablePtr = Arc<ItemTable>;

/// An ordered list of rows sharing one [`ItemGroupType`].
///
/// The first row added fixes the table's layout; every later row must
/// match it exactly. Rows are frozen as they are added, and once the
/// table is wrapped in an [`ItemTablePtr`] nothing in it can change.
#[derive(Debug, Clone, Default)]
pub struct ItemTable {
    groups: Vec<ItemGroupPtr>,
    group_type: Option<ItemGroupType>,
}

impl ItemTable {
    pub fn new() -> ItemTable {
        ItemTable::default()
    }

    pub fn add(&mut self, mut group: ItemGroup) -> Result<()> {
        let row_type = group.freeze().clone();
        match &self.group_type {
            Some(expected) if *expected != row_type => {
                return Err(HapiError::GroupTypeMismatch {
                    expected: expected.clone(),
                    found: row_type,
                });
            }
            Some(_) => (),
            None => self.group_type = Some(row_type),
        }
        self.groups.push(group.into_ptr());
        Ok(())
    }

    pub fn group_type(&self) -> Option<&ItemGroupType> {
        self.group_type.as_ref()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn num_columns(&self) -> usize {
        self.group_type.as_ref().map_or(0, |t| t.len())
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[ItemGroupPtr] {
        &self.groups
    }

    pub fn into_ptr(self) -> ItemTablePtr {
        Arc::new(self)
    }
}
