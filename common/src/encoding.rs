//! Consensus serialisation of headers and transactions
//! Little-endian fixed-width integers and compact-size length prefixes

use crate::types::{BlockHeader, Transaction};

#[derive(Default)]
pub struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    pub fn push_u8(&mut self, num: u8) {
        self.data.push(num);
    }

    pub fn push_u32(&mut self, num: u32) {
        self.data.extend_from_slice(&num.to_le_bytes());
    }

    pub fn push_i32(&mut self, num: i32) {
        self.data.extend_from_slice(&num.to_le_bytes());
    }

    pub fn push_u64(&mut self, num: u64) {
        self.data.extend_from_slice(&num.to_le_bytes());
    }

    pub fn push_i64(&mut self, num: i64) {
        self.data.extend_from_slice(&num.to_le_bytes());
    }

    /// Compact-size unsigned integer (1, 3, 5 or 9 bytes)
    pub fn push_compact_size(&mut self, num: u64) {
        match num {
            0..=0xfc => self.push_u8(num as u8),
            0xfd..=0xffff => {
                self.push_u8(0xfd);
                self.data.extend_from_slice(&(num as u16).to_le_bytes());
            }
            0x1_0000..=0xffff_ffff => {
                self.push_u8(0xfe);
                self.push_u32(num as u32);
            }
            _ => {
                self.push_u8(0xff);
                self.push_u64(num);
            }
        }
    }

    /// Length-prefixed byte string
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.push_compact_size(bytes.len() as u64);
        self.data.extend_from_slice(bytes);
    }

    /// Raw bytes with no length prefix
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Encode a header (80 bytes)
pub fn encode_header(e: &mut Encoder, header: &BlockHeader) {
    e.push_i32(header.version);
    e.append(header.prev_block.as_ref());
    e.append(header.merkle_root.as_ref());
    e.push_u32(header.time);
    e.push_u32(header.bits);
    e.push_u32(header.nonce);
}

/// Encode a transaction, with the extended witness format if `with_witness`
pub fn encode_transaction(e: &mut Encoder, tx: &Transaction, with_witness: bool) {
    e.push_i32(tx.version);
    if let Some(time) = tx.time {
        e.push_u32(time);
    }

    if with_witness {
        // Marker and flag
        e.push_u8(0x00);
        e.push_u8(0x01);
    }

    e.push_compact_size(tx.inputs.len() as u64);
    for input in &tx.inputs {
        e.append(input.prevout.hash.as_ref());
        e.push_u32(input.prevout.n);
        e.push_bytes(input.script_sig.as_bytes());
        e.push_u32(input.sequence);
    }

    e.push_compact_size(tx.outputs.len() as u64);
    for output in &tx.outputs {
        e.push_i64(output.value);
        e.push_bytes(output.script_pubkey.as_bytes());
    }

    if with_witness {
        for input in &tx.inputs {
            e.push_compact_size(input.witness.len() as u64);
            for item in &input.witness {
                e.push_bytes(item);
            }
        }
    }

    e.push_u32(tx.lock_time);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compact(num: u64) -> Vec<u8> {
        let mut e = Encoder::default();
        e.push_compact_size(num);
        e.to_vec()
    }

    #[test]
    fn compact_size_boundaries() {
        assert_eq!(compact(0), vec![0]);
        assert_eq!(compact(0xfc), vec![0xfc]);
        assert_eq!(compact(0xfd), vec![0xfd, 0xfd, 0x00]);
        assert_eq!(compact(0xffff), vec![0xfd, 0xff, 0xff]);
        assert_eq!(compact(0x1_0000), vec![0xfe, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(compact(0x1_0000_0000).len(), 9);
    }

    #[test]
    fn header_is_eighty_bytes() {
        let mut e = Encoder::default();
        encode_header(&mut e, &BlockHeader {
            version: 1,
            prev_block: Default::default(),
            merkle_root: Default::default(),
            time: 0,
            bits: 0x207fffff,
            nonce: 0,
        });
        assert_eq!(e.len(), 80);
    }
}
