// This file is part of Vigil NVR, a security camera network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The "blob tree" wire format returned by `/video` and `/key_frame`: a
//! tagged, self-describing, versioned tree with keyed children, indexed
//! arrays, and typed leaves (string, int, blob).
//!
//! Content type: `application/vnd.revere.blobtree.v1`.

use base::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

pub const CONTENT_TYPE: &str = "application/vnd.revere.blobtree.v1";
pub const VERSION: u8 = 1;

#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Str(String),
    Int(i64),
    Blob(Vec<u8>),
    Array(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl Node {
    pub fn map() -> MapBuilder {
        MapBuilder(Vec::new())
    }
}

#[derive(Default)]
pub struct MapBuilder(Vec<(String, Node)>);

impl MapBuilder {
    pub fn field(mut self, key: &str, value: Node) -> Self {
        self.0.push((key.to_string(), value));
        self
    }

    pub fn build(self) -> Node {
        Node::Map(self.0)
    }
}

fn write_varint<W: Write>(w: &mut W, mut v: u64) -> io::Result<()> {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        w.write_all(&[byte])?;
        if v == 0 {
            break;
        }
    }
    Ok(())
}

fn read_varint<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)?;
        result |= u64::from(b[0] & 0x7f) << shift;
        if b[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok(result)
}

fn encode_node(w: &mut impl Write, n: &Node) -> io::Result<()> {
    match n {
        Node::Str(s) => {
            w.write_u8(0)?;
            write_varint(w, s.len() as u64)?;
            w.write_all(s.as_bytes())
        }
        Node::Int(i) => {
            w.write_u8(1)?;
            w.write_i64::<LittleEndian>(*i)
        }
        Node::Blob(b) => {
            w.write_u8(2)?;
            write_varint(w, b.len() as u64)?;
            w.write_all(b)
        }
        Node::Array(items) => {
            w.write_u8(3)?;
            write_varint(w, items.len() as u64)?;
            for it in items {
                encode_node(w, it)?;
            }
            Ok(())
        }
        Node::Map(fields) => {
            w.write_u8(4)?;
            write_varint(w, fields.len() as u64)?;
            for (k, v) in fields {
                write_varint(w, k.len() as u64)?;
                w.write_all(k.as_bytes())?;
                encode_node(w, v)?;
            }
            Ok(())
        }
    }
}

fn decode_node(r: &mut impl Read) -> Result<Node, Error> {
    let tag = r.read_u8()?;
    Ok(match tag {
        0 => {
            let len = read_varint(r)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            Node::Str(String::from_utf8(buf).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?)
        }
        1 => Node::Int(r.read_i64::<LittleEndian>()?),
        2 => {
            let len = read_varint(r)? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            Node::Blob(buf)
        }
        3 => {
            let count = read_varint(r)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_node(r)?);
            }
            Node::Array(items)
        }
        4 => {
            let count = read_varint(r)?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let klen = read_varint(r)? as usize;
                let mut kbuf = vec![0u8; klen];
                r.read_exact(&mut kbuf)?;
                let key = String::from_utf8(kbuf).map_err(|e| Error::wrap(base::ErrorKind::Internal, e))?;
                fields.push((key, decode_node(r)?));
            }
            Node::Map(fields)
        }
        _ => return Err(Error::new(base::ErrorKind::Internal, format!("bad node tag {tag}"))),
    })
}

/// Serializes `root` (expected to be a [`Node::Map`]) prefixed with a
/// one-byte version tag.
pub fn encode(root: &Node) -> Vec<u8> {
    let mut buf = vec![VERSION];
    encode_node(&mut buf, root).expect("Vec<u8> writes never fail");
    buf
}

pub fn decode(buf: &[u8]) -> Result<Node, Error> {
    if buf.is_empty() {
        return Err(Error::new(base::ErrorKind::InvalidArgument, "empty blob tree"));
    }
    if buf[0] != VERSION {
        return Err(Error::new(
            base::ErrorKind::InvalidArgument,
            format!("unsupported blob tree version {}", buf[0]),
        ));
    }
    let mut c = Cursor::new(&buf[1..]);
    decode_node(&mut c)
}

impl Node {
    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Map(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Node]> {
        match self {
            Node::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Node::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Node::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Node::Blob(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_query_shape() {
        let frame = Node::map()
            .field("stream_id", Node::Str("video".into()))
            .field("key", Node::Str("true".into()))
            .field("ts", Node::Int(1234))
            .field("data", Node::Blob(vec![1, 2, 3]))
            .build();
        let root = Node::map()
            .field("has_audio", Node::Str("false".into()))
            .field("video_codec_name", Node::Str("h264".into()))
            .field("video_codec_parameters", Node::Blob(vec![0xde, 0xad]))
            .field("frames", Node::Array(vec![frame]))
            .build();
        let bytes = encode(&root);
        assert_eq!(bytes[0], VERSION);
        let decoded = decode(&bytes).unwrap();
        let frames = decoded.get("frames").unwrap().as_array().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get("ts").unwrap().as_int(), Some(1234));
        assert_eq!(frames[0].get("data").unwrap().as_blob(), Some(&[1u8, 2, 3][..]));
    }
}
