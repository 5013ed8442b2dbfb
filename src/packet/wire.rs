//! Small helpers shared by the payload codecs of the concrete packet types.

use anyhow::anyhow;
use bytes::{Buf, BufMut};

use crate::packet::types::{Coordinate, FullItemId, MapId};

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    let bytes = s.as_bytes();
    assert!(bytes.len() <= u16::MAX as usize, "string too long for the wire");
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_u16()? as usize;
    if buf.remaining() < len {
        return Err(anyhow!("string length {} exceeds remaining buffer {}", len, buf.remaining()));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(String::from_utf8(bytes)?)
}

pub fn put_coordinate(buf: &mut impl BufMut, coord: &Coordinate) {
    buf.put_i32(coord.lat);
    buf.put_i32(coord.lon);
}

pub fn try_get_coordinate(buf: &mut impl Buf) -> anyhow::Result<Coordinate> {
    let lat = buf.try_get_i32()?;
    let lon = buf.try_get_i32()?;
    Ok(Coordinate { lat, lon })
}

pub fn put_item_id(buf: &mut impl BufMut, id: &FullItemId) {
    buf.put_u32(id.map_id.0);
    buf.put_u32(id.item_id);
}

pub fn try_get_item_id(buf: &mut impl Buf) -> anyhow::Result<FullItemId> {
    let map_id = MapId(buf.try_get_u32()?);
    let item_id = buf.try_get_u32()?;
    Ok(FullItemId { map_id, item_id })
}
