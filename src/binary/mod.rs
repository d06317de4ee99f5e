//! The XMPP-like binary node wire codec: tag/attributes/body trees, encoded with a
//! dictionary-first, length-prefixed-fallback scheme for compactness.

pub mod tokens;

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::BinaryNodeError;
use crate::jid::Jid;
use tokens::{
    char_for_nibble, double_byte_token_for, is_nibble_packable, jid_server_token_for,
    nibble_for_char, single_byte_token_for, DOUBLE_BYTE_TOKENS, JID_SERVER_TOKENS,
    NIBBLE_FILLER, SINGLE_BYTE_TOKENS,
};

/// Upper bound on a single decoded string/payload, defending against hostile length
/// prefixes without requiring a full second pass over the input.
const MAX_SYMBOL_LEN: usize = 16 * 1024 * 1024;
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryNode {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub content: NodeContent,
}

impl BinaryNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: HashMap::new(),
            content: NodeContent::Empty,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn with_children(mut self, children: Vec<BinaryNode>) -> Self {
        self.content = NodeContent::Nodes(children);
        self
    }

    pub fn with_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.content = NodeContent::Bytes(bytes.into());
        self
    }

    pub fn children(&self) -> &[BinaryNode] {
        match &self.content {
            NodeContent::Nodes(nodes) => nodes,
            _ => &[],
        }
    }

    pub fn child_by_tag(&self, tag: &str) -> Option<&BinaryNode> {
        self.children().iter().find(|n| n.tag == tag)
    }

    /// Every direct child matching `tag`, in document order. Stanzas like `<message>` can
    /// carry more than one `<enc>` child (e.g. a group message's per-recipient `pkmsg`
    /// alongside its `skmsg`), which `child_by_tag`'s first-match semantics can't see.
    pub fn children_by_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a BinaryNode> {
        self.children().iter().filter(move |n| n.tag == tag)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn attr_jid(&self, key: &str) -> Result<Option<Jid>, BinaryNodeError> {
        match self.attrs.get(key) {
            Some(raw) => Ok(Some(Jid::parse(raw)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    Nodes(Vec<BinaryNode>),
    Bytes(Bytes),
    Empty,
}

pub fn decode(input: &[u8]) -> Result<BinaryNode, BinaryNodeError> {
    let mut decoder = Decoder::new(input);
    let node = decoder.decode_node()?;
    if !decoder.is_eof() {
        return Err(BinaryNodeError::TrailingBytes);
    }
    Ok(node)
}

pub fn encode(node: &BinaryNode) -> Result<Vec<u8>, BinaryNodeError> {
    let mut output = Vec::new();
    encode_node(node, &mut output)?;
    Ok(output)
}

struct Decoder<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, position: 0 }
    }

    fn is_eof(&self) -> bool {
        self.position == self.input.len()
    }

    fn decode_node(&mut self) -> Result<BinaryNode, BinaryNodeError> {
        let tag = self.decode_symbol()?;

        let attrs_count = self.read_u16()? as usize;
        let mut attrs = HashMap::with_capacity(attrs_count);
        for _ in 0..attrs_count {
            let key = self.decode_symbol()?;
            let value = self.decode_symbol()?;
            attrs.insert(key, value);
        }

        let content = self.decode_content()?;

        Ok(BinaryNode { tag, attrs, content })
    }

    fn decode_content(&mut self) -> Result<NodeContent, BinaryNodeError> {
        let content_type = self.read_u8()?;
        match content_type {
            0 => Ok(NodeContent::Empty),
            1 => {
                let len = self.read_u32()? as usize;
                if len > MAX_PAYLOAD_LEN {
                    return Err(BinaryNodeError::PayloadTooLarge);
                }
                let payload = self.read_bytes(len)?;
                Ok(NodeContent::Bytes(Bytes::copy_from_slice(payload)))
            }
            2 => {
                let count = self.read_u16()? as usize;
                let mut nodes = Vec::with_capacity(count);
                for _ in 0..count {
                    nodes.push(self.decode_node()?);
                }
                Ok(NodeContent::Nodes(nodes))
            }
            value => Err(BinaryNodeError::InvalidContentType(value)),
        }
    }

    fn decode_symbol(&mut self) -> Result<String, BinaryNodeError> {
        let symbol_type = self.read_u8()?;
        match symbol_type {
            1 => {
                let token = self.read_u8()? as usize;
                let value = SINGLE_BYTE_TOKENS[token];
                if value.is_empty() {
                    return Err(BinaryNodeError::UnknownSingleByteToken(token as u8));
                }
                Ok(value.to_owned())
            }
            2 => {
                let len = self.read_u16()? as usize;
                if len > MAX_SYMBOL_LEN {
                    return Err(BinaryNodeError::SymbolTooLong);
                }
                let bytes = self.read_bytes(len)?;
                String::from_utf8(bytes.to_vec()).map_err(|_| BinaryNodeError::InvalidUtf8)
            }
            3 => {
                let token = self.read_u16()? as usize;
                let value = DOUBLE_BYTE_TOKENS
                    .get(token)
                    .copied()
                    .filter(|v| !v.is_empty())
                    .ok_or(BinaryNodeError::UnknownDoubleByteToken(token as u16))?;
                Ok(value.to_owned())
            }
            4 => self.decode_nibble_packed(),
            5 => self.decode_jid(),
            value => Err(BinaryNodeError::InvalidSymbolType(value)),
        }
    }

    fn decode_nibble_packed(&mut self) -> Result<String, BinaryNodeError> {
        let digit_count = self.read_u8()? as usize;
        let byte_count = digit_count.div_ceil(2);
        let bytes = self.read_bytes(byte_count)?;

        let mut out = String::with_capacity(digit_count);
        for (i, byte) in bytes.iter().enumerate() {
            let high = byte >> 4;
            let low = byte & 0x0F;
            if i * 2 < digit_count {
                out.push(char_for_nibble(high).ok_or(BinaryNodeError::InvalidNibble(high))?);
            }
            if i * 2 + 1 < digit_count {
                out.push(char_for_nibble(low).ok_or(BinaryNodeError::InvalidNibble(low))?);
            }
        }
        Ok(out)
    }

    fn decode_jid(&mut self) -> Result<String, BinaryNodeError> {
        let agent = self.read_u8()?;
        let device = self.read_u16()?;
        let user = self.decode_symbol()?;
        let server_token = self.read_u8()?;
        let server = JID_SERVER_TOKENS
            .get(server_token as usize)
            .copied()
            .ok_or(BinaryNodeError::UnknownJidServerToken(server_token))?;

        let jid = Jid {
            user,
            agent,
            device,
            server: server.to_owned(),
            integrator: None,
        };
        Ok(jid.to_string())
    }

    fn read_u8(&mut self) -> Result<u8, BinaryNodeError> {
        let byte = self
            .input
            .get(self.position)
            .copied()
            .ok_or(BinaryNodeError::UnexpectedEof)?;
        self.position += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, BinaryNodeError> {
        let raw = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, BinaryNodeError> {
        let raw = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], BinaryNodeError> {
        let end = self.position.checked_add(len).ok_or(BinaryNodeError::UnexpectedEof)?;
        if end > self.input.len() {
            return Err(BinaryNodeError::UnexpectedEof);
        }
        let bytes = &self.input[self.position..end];
        self.position = end;
        Ok(bytes)
    }
}

fn encode_node(node: &BinaryNode, output: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    encode_symbol(&node.tag, output)?;

    let attrs_len = u16::try_from(node.attrs.len()).map_err(|_| BinaryNodeError::TooManyAttributes)?;
    output.extend_from_slice(&attrs_len.to_be_bytes());

    let mut keys: Vec<&String> = node.attrs.keys().collect();
    keys.sort_unstable();

    for key in keys {
        let value = node
            .attrs
            .get(key)
            .ok_or(BinaryNodeError::AttributeLookupFailed)?;
        encode_symbol(key, output)?;
        encode_symbol(value, output)?;
    }

    match &node.content {
        NodeContent::Empty => output.push(0),
        NodeContent::Bytes(payload) => {
            let len = u32::try_from(payload.len()).map_err(|_| BinaryNodeError::PayloadTooLarge)?;
            output.push(1);
            output.extend_from_slice(&len.to_be_bytes());
            output.extend_from_slice(payload.as_ref());
        }
        NodeContent::Nodes(nodes) => {
            let count = u16::try_from(nodes.len()).map_err(|_| BinaryNodeError::TooManyChildren)?;
            output.push(2);
            output.extend_from_slice(&count.to_be_bytes());
            for node in nodes {
                encode_node(node, output)?;
            }
        }
    }

    Ok(())
}

fn encode_symbol(symbol: &str, output: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    if let Some(jid) = try_parse_jid(symbol) {
        return encode_jid(&jid, output);
    }

    if is_nibble_packable(symbol) && symbol.len() <= 255 {
        return encode_nibble_packed(symbol, output);
    }

    if let Some(index) = single_byte_token_for(symbol) {
        output.push(1);
        output.push(index);
        return Ok(());
    }

    if let Some(index) = double_byte_token_for(symbol) {
        output.push(3);
        output.extend_from_slice(&index.to_be_bytes());
        return Ok(());
    }

    let symbol_bytes = symbol.as_bytes();
    let len = u16::try_from(symbol_bytes.len()).map_err(|_| BinaryNodeError::SymbolTooLong)?;
    output.push(2);
    output.extend_from_slice(&len.to_be_bytes());
    output.extend_from_slice(symbol_bytes);
    Ok(())
}

fn try_parse_jid(symbol: &str) -> Option<Jid> {
    let jid = Jid::parse(symbol).ok()?;
    jid_server_token_for(&jid.server)?;
    Some(jid)
}

fn encode_jid(jid: &Jid, output: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    let server_token = jid_server_token_for(&jid.server)
        .ok_or_else(|| BinaryNodeError::UnknownJidServerToken(0))?;

    output.push(5);
    output.push(jid.agent);
    output.extend_from_slice(&jid.device.to_be_bytes());
    encode_symbol(&jid.user, output)?;
    output.push(server_token);
    Ok(())
}

fn encode_nibble_packed(symbol: &str, output: &mut Vec<u8>) -> Result<(), BinaryNodeError> {
    let digits: Vec<u8> = symbol
        .chars()
        .map(|c| nibble_for_char(c).ok_or(BinaryNodeError::InvalidNibble(0)))
        .collect::<Result<_, _>>()?;

    output.push(4);
    output.push(digits.len() as u8);

    for chunk in digits.chunks(2) {
        let high = chunk[0];
        let low = chunk.get(1).copied().unwrap_or(NIBBLE_FILLER);
        output.push((high << 4) | low);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tag: &str) -> BinaryNode {
        BinaryNode::new(tag)
    }

    #[test]
    fn round_trips_empty_node() {
        let node = leaf("iq").with_attr("id", "abc123").with_attr("type", "get");
        let encoded = encode(&node).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn children_by_tag_finds_every_matching_child() {
        let node = leaf("message").with_children(vec![
            leaf("enc").with_attr("type", "pkmsg").with_bytes(&b"a"[..]),
            leaf("enc").with_attr("type", "skmsg").with_bytes(&b"b"[..]),
            leaf("enc").with_attr("type", "msg").with_bytes(&b"c"[..]),
        ]);
        let types: Vec<&str> = node.children_by_tag("enc").map(|n| n.attr("type").unwrap()).collect();
        assert_eq!(types, vec!["pkmsg", "skmsg", "msg"]);
        assert!(node.children_by_tag("absent").next().is_none());
    }

    #[test]
    fn round_trips_nested_nodes_with_bytes_leaf() {
        let node = leaf("message")
            .with_attr("to", "5511999999999@s.whatsapp.net")
            .with_children(vec![leaf("enc").with_bytes(&b"ciphertext"[..])]);
        let encoded = encode(&node).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn round_trips_jid_with_device_and_agent() {
        let node = leaf("participant").with_attr("jid", "5511999999999_3.7@s.whatsapp.net");
        let encoded = encode(&node).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn round_trips_group_jid() {
        let node = leaf("to").with_attr("jid", "12345-67890@g.us");
        let decoded = decode(&encode(&node).unwrap()).unwrap();
        assert_eq!(node, decoded);
    }

    #[test]
    fn encodes_known_tokens_compactly() {
        let encoded = encode(&leaf("message")).unwrap();
        // tag: 1 (symbol type) + 1 (token index) + 2 (attr count) + 1 (content type)
        assert_eq!(encoded.len(), 5);
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut encoded = encode(&leaf("id")).unwrap();
        encoded.push(0xFF);
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        let encoded = encode(&leaf("message").with_attr("id", "x"));
        let mut bytes = encoded.unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(decode(&bytes), Err(BinaryNodeError::UnexpectedEof)));
    }

    #[test]
    fn nibble_packing_handles_odd_length() {
        let node = leaf("user").with_attr("phone", "5511999999999");
        let decoded = decode(&encode(&node).unwrap()).unwrap();
        assert_eq!(decoded.attr("phone"), Some("5511999999999"));
    }
}
