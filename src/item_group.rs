// Copyright 2020 Joyent, Inc.

//! Rows of items and their type signatures.

use std::fmt;
use std::sync::Arc;

use crate::error::{HapiError, Result};
use crate::item_data::{ItemData, ItemDataPtr, ItemDataType, ItemId};

pub type ItemGroupPtr = Arc<ItemGroup>;

/// The per-position types of a frozen row. Tables use it to check that
/// every row has the same layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemGroupType(Vec<ItemDataType>);

impl ItemGroupType {
    pub fn new(types: Vec<ItemDataType>) -> ItemGroupType {
        ItemGroupType(types)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn types(&self) -> &[ItemDataType] {
        &self.0
    }
}

impl fmt::Display for ItemGroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, t) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", t)?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ItemGroup {
    items: Vec<ItemDataPtr>,
    group_type: Option<ItemGroupType>,
}

impl ItemGroup {
    pub fn new() -> ItemGroup {
        ItemGroup::default()
    }

    /// Builds a group whose layout must equal `group_type`. Adding an item
    /// at a position with a different type fails.
    pub fn with_type(group_type: ItemGroupType) -> ItemGroup {
        ItemGroup {
            items: Vec::with_capacity(group_type.len()),
            group_type: Some(group_type),
        }
    }

    pub fn add(&mut self, item: ItemDataPtr) -> Result<()> {
        if let Some(group_type) = &self.group_type {
            let pos = self.items.len();
            match group_type.types().get(pos) {
                Some(t) if *t == item.data_type() => (),
                _ => return Err(self.rejection(item.data_type())),
            }
        }
        self.items.push(item);
        Ok(())
    }

    /// Convenience wrapper around [`add`](#method.add).
    pub fn add_data(&mut self, item: ItemData) -> Result<()> {
        self.add(item.into_ptr())
    }

    /// Fixes the layout. Later additions fail.
    pub fn freeze(&mut self) -> &ItemGroupType {
        let items = &self.items;
        self.group_type
            .get_or_insert_with(|| ItemGroupType(items.iter().map(|i| i.data_type()).collect()))
    }

    pub fn is_frozen(&self) -> bool {
        self.group_type.is_some()
    }

    pub fn group_type(&self) -> Option<&ItemGroupType> {
        self.group_type.as_ref()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[ItemDataPtr] {
        &self.items
    }

    pub fn get_at(&self, index: usize) -> Option<&ItemDataPtr> {
        self.items.get(index)
    }

    /// The last item registered under `id`.
    pub fn get(&self, id: ItemId) -> Option<&ItemDataPtr> {
        self.items.iter().rev().find(|i| i.id() == id)
    }

    /// Every item registered under `id`, in row order.
    pub fn get_all(&self, id: ItemId) -> impl Iterator<Item = &ItemDataPtr> {
        self.items.iter().filter(move |i| i.id() == id)
    }

    pub fn into_ptr(self) -> ItemGroupPtr {
        Arc::new(self)
    }

    fn rejection(&self, data_type: ItemDataType) -> HapiError {
        let expected = self.group_type.clone().unwrap_or_default();
        if self.items.len() >= expected.len() {
            return HapiError::GroupFrozen;
        }
        let mut found: Vec<ItemDataType> = self.items.iter().map(|i| i.data_type()).collect();
        found.push(data_type);
        HapiError::GroupTypeMismatch {
            expected,
            found: ItemGroupType(found),
        }
    }
}
