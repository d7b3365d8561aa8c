// Copyright 2020 Joyent, Inc.

//! Typed scalar values carried in item tables.
//!
//! An [`ItemData`] is immutable once built. Sharing happens through
//! [`ItemDataPtr`] (an `Arc`), so a decoded table can be handed from the
//! receive thread to any consumer without copying or locking.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use num_derive::{FromPrimitive, ToPrimitive};

pub type ItemId = u64;

/// Id used by items that do not belong to any logical column.
pub const ITEM_ID_ANONYMOUS: ItemId = u64::max_value();

pub type ItemDataPtr = Arc<ItemData>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive,
)]
pub enum ItemDataType {
    Bool = 0,
    Int = 1,
    Uint64 = 2,
    Double = 3,
    String = 4,
}

impl fmt::Display for ItemDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemDataType::Bool => "BOOL",
            ItemDataType::Int => "INT",
            ItemDataType::Uint64 => "UINT64",
            ItemDataType::Double => "DOUBLE",
            ItemDataType::String => "STRING",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    Bool(bool),
    Int(i32),
    Uint64(u64),
    Double(f64),
    String(String),
}

impl ItemValue {
    pub fn data_type(&self) -> ItemDataType {
        match self {
            ItemValue::Bool(_) => ItemDataType::Bool,
            ItemValue::Int(_) => ItemDataType::Int,
            ItemValue::Uint64(_) => ItemDataType::Uint64,
            ItemValue::Double(_) => ItemDataType::Double,
            ItemValue::String(_) => ItemDataType::String,
        }
    }

    /// The value written to the wire body when an item is null.
    pub fn default_for(data_type: ItemDataType) -> ItemValue {
        match data_type {
            ItemDataType::Bool => ItemValue::Bool(false),
            ItemDataType::Int => ItemValue::Int(0),
            ItemDataType::Uint64 => ItemValue::Uint64(0),
            ItemDataType::Double => ItemValue::Double(0.0),
            ItemDataType::String => ItemValue::String(String::new()),
        }
    }
}

impl fmt::Display for ItemValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemValue::Bool(v) => write!(f, "{}", v),
            ItemValue::Int(v) => write!(f, "{}", v),
            ItemValue::Uint64(v) => write!(f, "{}", v),
            ItemValue::Double(v) => write!(f, "{}", v),
            ItemValue::String(v) => f.write_str(v),
        }
    }
}

/// Rust types that can be extracted from an [`ItemData`].
pub trait ItemValueType: Sized {
    const DATA_TYPE: ItemDataType;

    fn from_value(value: &ItemValue) -> Option<Self>;
}

macro_rules! impl_item_value_type {
    ($t:ty, $variant:ident) => {
        impl ItemValueType for $t {
            const DATA_TYPE: ItemDataType = ItemDataType::$variant;

            fn from_value(value: &ItemValue) -> Option<Self> {
                match value {
                    ItemValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }

        impl From<$t> for ItemValue {
            fn from(v: $t) -> Self {
                ItemValue::$variant(v)
            }
        }
    };
}

impl_item_value_type!(bool, Bool);
impl_item_value_type!(i32, Int);
impl_item_value_type!(u64, Uint64);
impl_item_value_type!(f64, Double);
impl_item_value_type!(String, String);

impl From<&str> for ItemValue {
    fn from(v: &str) -> Self {
        ItemValue::String(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemData {
    id: ItemId,
    value: ItemValue,
    null: bool,
}

impl ItemData {
    pub fn new<V: Into<ItemValue>>(id: ItemId, value: V) -> ItemData {
        ItemData {
            id,
            value: value.into(),
            null: false,
        }
    }

    pub fn with_null<V: Into<ItemValue>>(id: ItemId, value: V, null: bool) -> ItemData {
        ItemData {
            id,
            value: value.into(),
            null,
        }
    }

    /// A null item of the given type. Its value is the type's default.
    pub fn null(id: ItemId, data_type: ItemDataType) -> ItemData {
        ItemData {
            id,
            value: ItemValue::default_for(data_type),
            null: true,
        }
    }

    pub fn into_ptr(self) -> ItemDataPtr {
        Arc::new(self)
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn data_type(&self) -> ItemDataType {
        self.value.data_type()
    }

    pub fn is_null(&self) -> bool {
        self.null
    }

    pub fn value(&self) -> &ItemValue {
        &self.value
    }

    /// Returns the payload as `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not the stored type. Asking for the wrong type
    /// means the producer and consumer disagree on the table layout.
    pub fn get<T: ItemValueType>(&self) -> T {
        match T::from_value(&self.value) {
            Some(v) => v,
            None => panic!(
                "ItemData {}: requested {} but holds {}",
                self.id,
                T::DATA_TYPE,
                self.data_type()
            ),
        }
    }

    pub fn try_get<T: ItemValueType>(&self) -> Option<T> {
        T::from_value(&self.value)
    }

    /// Compares the payloads of two items.
    ///
    /// Numeric types compare across each other: a negative INT is less
    /// than every UINT64, and DOUBLE compares by value. BOOL and STRING
    /// only compare with their own type.
    ///
    /// # Panics
    ///
    /// Panics when the types are not comparable, or when a DOUBLE is NaN.
    pub fn compare(&self, other: &ItemData) -> Ordering {
        use ItemValue::*;

        let ordering = match (&self.value, &other.value) {
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (String(a), String(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Uint64(a), Uint64(b)) => Some(a.cmp(b)),
            (Int(a), Uint64(b)) => Some(compare_int_uint64(*a, *b)),
            (Uint64(a), Int(b)) => Some(compare_int_uint64(*b, *a).reverse()),
            (Double(a), Double(b)) => a.partial_cmp(b),
            (Double(a), Int(b)) => a.partial_cmp(&f64::from(*b)),
            (Int(a), Double(b)) => f64::from(*a).partial_cmp(b),
            (Double(a), Uint64(b)) => a.partial_cmp(&(*b as f64)),
            (Uint64(a), Double(b)) => (*a as f64).partial_cmp(b),
            _ => panic!(
                "ItemData: cannot compare {} with {}",
                self.data_type(),
                other.data_type()
            ),
        };
        ordering.unwrap_or_else(|| panic!("ItemData: NaN is not comparable"))
    }

    pub fn value_eq(&self, other: &ItemData) -> bool {
        self.compare(other) == Ordering::Equal
    }

    pub fn value_lt(&self, other: &ItemData) -> bool {
        self.compare(other) == Ordering::Less
    }

    pub fn value_gt(&self, other: &ItemData) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

fn compare_int_uint64(a: i32, b: u64) -> Ordering {
    if a < 0 {
        Ordering::Less
    } else {
        (a as u64).cmp(&b)
    }
}

impl fmt::Display for ItemData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.null {
            write!(f, "{}:{}(null)", self.id, self.data_type())
        } else {
            write!(f, "{}:{}({})", self.id, self.data_type(), self.value)
        }
    }
}
