// Copyright 2020 Joyent, Inc.

//! Wire encoding of items, rows and tables.
//!
//! ItemData record:
//!
//! ```text
//! offset 0:  u8  null flag (0 = not null, 1 = null)
//! offset 1:  u16 type (0=BOOL, 1=INT, 2=UINT64, 3=DOUBLE, 4=STRING)
//! offset 3:  u64 item id
//! offset 11: body
//!   BOOL    u8
//!   INT     i64, sign extended
//!   UINT64  u64
//!   DOUBLE  8 bytes, host float layout
//!   STRING  u32 length, bytes, NUL
//! ```
//!
//! ItemGroup record: `u16 flags, u16 numItems, u32 length` then the items.
//! ItemTable record: `u16 flags, u32 numGroups, u32 length` then the rows.
//! Lengths include the record's own header.
//!
//! A null item still carries a body holding its type's default value; a
//! null STRING is written as a zero-length string. Readers must check the
//! null flag before trusting the body.

use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::error::{HapiError, Result};
use crate::item_data::{ItemData, ItemDataType, ItemValue};
use crate::item_group::ItemGroup;
use crate::item_table::{ItemTable, ItemTablePtr};
use crate::wire::{put_inline_string, WireReader};

pub const ITEM_DATA_HEADER_SIZE: usize = 11;
pub const ITEM_GROUP_HEADER_SIZE: usize = 8;
pub const ITEM_TABLE_HEADER_SIZE: usize = 10;

const NULL_FLAG_NOT_NULL: u8 = 0;
const NULL_FLAG_NULL: u8 = 1;

pub fn encode_item_data(item: &ItemData, buf: &mut BytesMut) {
    let data_type = item.data_type();
    buf.reserve(ITEM_DATA_HEADER_SIZE + 8);
    buf.put_u8(if item.is_null() {
        NULL_FLAG_NULL
    } else {
        NULL_FLAG_NOT_NULL
    });
    // The enum is C-like, so this never falls back.
    buf.put_u16_le(data_type.to_u16().unwrap_or_default());
    buf.put_u64_le(item.id());

    let default_value;
    let value = if item.is_null() {
        default_value = ItemValue::default_for(data_type);
        &default_value
    } else {
        item.value()
    };

    match value {
        ItemValue::Bool(v) => buf.put_u8(*v as u8),
        ItemValue::Int(v) => buf.put_i64_le(i64::from(*v)),
        ItemValue::Uint64(v) => buf.put_u64_le(*v),
        ItemValue::Double(v) => buf.put_slice(&v.to_ne_bytes()),
        ItemValue::String(v) => put_inline_string(buf, v),
    }
}

pub fn decode_item_data(reader: &mut WireReader<'_>) -> Result<ItemData> {
    let null = match reader.read_u8()? {
        NULL_FLAG_NOT_NULL => false,
        NULL_FLAG_NULL => true,
        flag => return Err(HapiError::broken(format!("invalid null flag: {}", flag))),
    };
    let raw_type = reader.read_u16()?;
    let data_type: ItemDataType =
        FromPrimitive::from_u16(raw_type).ok_or(HapiError::UnknownItemType(raw_type))?;
    let id = reader.read_u64()?;

    let value = match data_type {
        ItemDataType::Bool => match reader.read_u8()? {
            0 => ItemValue::Bool(false),
            1 => ItemValue::Bool(true),
            v => return Err(HapiError::broken(format!("invalid bool value: {}", v))),
        },
        ItemDataType::Int => {
            let wide = reader.read_i64()?;
            let v = i32::try_from(wide)
                .map_err(|_| HapiError::broken(format!("INT value out of range: {}", wide)))?;
            ItemValue::Int(v)
        }
        ItemDataType::Uint64 => ItemValue::Uint64(reader.read_u64()?),
        ItemDataType::Double => ItemValue::Double(reader.read_f64()?),
        ItemDataType::String => ItemValue::String(reader.read_inline_string()?),
    };

    Ok(ItemData::with_null(id, value, null))
}

pub fn encode_item_group(group: &ItemGroup, buf: &mut BytesMut) -> Result<()> {
    let num_items = u16::try_from(group.len()).map_err(|_| {
        HapiError::Handler(format!("too many items in a group: {}", group.len()))
    })?;
    let start = buf.len();
    buf.reserve(ITEM_GROUP_HEADER_SIZE);
    buf.put_u16_le(0);
    buf.put_u16_le(num_items);
    buf.put_u32_le(0);
    for item in group.items() {
        encode_item_data(item, buf);
    }
    patch_length(buf, start, 4)
}

/// Decodes one group record. The group is frozen before it is returned.
pub fn decode_item_group(reader: &mut WireReader<'_>) -> Result<ItemGroup> {
    let mut record = record_reader(reader, ITEM_GROUP_HEADER_SIZE, 4, "group")?;
    let _flags = record.read_u16()?;
    let num_items = record.read_u16()?;
    let _length = record.read_u32()?;

    let mut group = ItemGroup::new();
    for _ in 0..num_items {
        group.add_data(decode_item_data(&mut record)?)?;
    }
    if !record.is_empty() {
        return Err(HapiError::broken(format!(
            "{} stray bytes after group items",
            record.remaining()
        )));
    }
    group.freeze();
    Ok(group)
}

pub fn encode_item_table(table: &ItemTable, buf: &mut BytesMut) -> Result<()> {
    let start = buf.len();
    buf.reserve(ITEM_TABLE_HEADER_SIZE);
    buf.put_u16_le(0);
    buf.put_u32_le(table.num_groups() as u32);
    buf.put_u32_le(0);
    for group in table.groups() {
        encode_item_group(group, buf)?;
    }
    patch_length(buf, start, 6)
}

pub fn decode_item_table(reader: &mut WireReader<'_>) -> Result<ItemTable> {
    let mut record = record_reader(reader, ITEM_TABLE_HEADER_SIZE, 6, "table")?;
    let _flags = record.read_u16()?;
    let num_groups = record.read_u32()?;
    let _length = record.read_u32()?;

    let mut table = ItemTable::new();
    for _ in 0..num_groups {
        table.add(decode_item_group(&mut record)?)?;
    }
    if !record.is_empty() {
        return Err(HapiError::broken(format!(
            "{} stray bytes after table rows",
            record.remaining()
        )));
    }
    Ok(table)
}

/// Encodes a whole table as a standalone body.
pub fn table_to_bytes(table: &ItemTable) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_item_table(table, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes a body holding exactly one table.
pub fn table_from_bytes(body: &[u8]) -> Result<ItemTablePtr> {
    let mut reader = WireReader::new(body);
    let table = decode_item_table(&mut reader)?;
    if !reader.is_empty() {
        return Err(HapiError::broken("trailing bytes after table"));
    }
    Ok(table.into_ptr())
}

fn patch_length(buf: &mut BytesMut, start: usize, field_offset: usize) -> Result<()> {
    let length = u32::try_from(buf.len() - start)
        .map_err(|_| HapiError::Handler("record exceeds 4 GiB".to_string()))?;
    let at = start + field_offset;
    LittleEndian::write_u32(&mut buf[at..at + 4], length);
    Ok(())
}

/// Peeks the record's declared length, checks it against what is left and
/// returns a reader confined to the record.
fn record_reader<'a>(
    reader: &mut WireReader<'a>,
    header_size: usize,
    length_offset: usize,
    what: &str,
) -> Result<WireReader<'a>> {
    let rest = reader.rest();
    if rest.len() < header_size {
        return Err(HapiError::broken(format!(
            "{} header needs {} bytes, {} left",
            what,
            header_size,
            rest.len()
        )));
    }
    let length = LittleEndian::read_u32(&rest[length_offset..length_offset + 4]) as usize;
    if length < header_size || length > rest.len() {
        return Err(HapiError::broken(format!(
            "{} length {} is invalid with {} bytes left",
            what,
            length,
            rest.len()
        )));
    }
    reader.sub_reader(length)
}
