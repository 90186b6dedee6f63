//! Script inspection
//! Opcode walking, signature-operation counting and template matching.
//! Scripts are never executed here - that is the job of the external verifier.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Scripts above this size can never be spent
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Sig-op count charged for an inaccurately counted CHECKMULTISIG
const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// Header of a witness commitment output: OP_RETURN, push 36, magic
pub const WITNESS_COMMITMENT_HEADER: [u8; 6] = [OP_RETURN, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// One decoded script operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,

    /// Pushed bytes for push operations
    pub data: Option<&'a [u8]>,
}

/// Iterator over the operations of a script; stops at the first malformed push
pub struct Instructions<'a> {
    bytes: &'a [u8],
    pos: usize,
    malformed: bool,
}

impl<'a> Instructions<'a> {
    fn decode(&mut self) -> Option<Instruction<'a>> {
        let opcode = *self.bytes.get(self.pos)?;
        self.pos += 1;

        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *self.bytes.get(self.pos)? as usize;
                self.pos += 1;
                len
            }
            OP_PUSHDATA2 => {
                let raw = self.bytes.get(self.pos..self.pos + 2)?;
                self.pos += 2;
                u16::from_le_bytes([raw[0], raw[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let raw = self.bytes.get(self.pos..self.pos + 4)?;
                self.pos += 4;
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
            }
            _ => {
                return Some(Instruction { opcode, data: None });
            }
        };

        let data = self.bytes.get(self.pos..self.pos.checked_add(len)?)?;
        self.pos += len;
        Some(Instruction {
            opcode,
            data: Some(data),
        })
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let instruction = self.decode();
        if instruction.is_none() {
            self.malformed = true;
            self.pos = self.bytes.len();
        }
        instruction
    }
}

/// Serialised script
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            bytes: &self.0,
            pos: 0,
            malformed: false,
        }
    }

    /// Append a raw opcode
    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.0.push(opcode);
        self
    }

    /// Append a minimal data push
    pub fn push_data(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len < OP_PUSHDATA1 as usize {
            self.0.push(len as u8);
        } else if len <= 0xff {
            self.0.push(OP_PUSHDATA1);
            self.0.push(len as u8);
        } else if len <= 0xffff {
            self.0.push(OP_PUSHDATA2);
            self.0.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.0.push(OP_PUSHDATA4);
            self.0.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Append an integer the way script builders do: small numbers as
    /// OP_N, everything else as a minimally encoded script number
    pub fn push_int(self, n: i64) -> Self {
        match n {
            0 => self.push_opcode(OP_0),
            -1 => self.push_opcode(OP_1NEGATE),
            1..=16 => self.push_opcode(OP_1 + (n as u8) - 1),
            _ => self.push_data(&encode_script_num(n)),
        }
    }

    /// Legacy signature operation count
    pub fn sig_op_count(&self, accurate: bool) -> u32 {
        let mut count = 0u32;
        let mut last_opcode = 0xffu8;
        for instruction in self.instructions() {
            match instruction.opcode {
                OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    if accurate && (OP_1..=OP_16).contains(&last_opcode) {
                        count += (last_opcode - OP_1 + 1) as u32;
                    } else {
                        count += MAX_PUBKEYS_PER_MULTISIG;
                    }
                }
                _ => {}
            }
            last_opcode = instruction.opcode;
        }
        count
    }

    /// Sig-ops of the redeem script revealed by `script_sig`, if this is P2SH
    pub fn p2sh_sig_op_count(&self, script_sig: &Script) -> u32 {
        if !self.is_pay_to_script_hash() {
            return self.sig_op_count(true);
        }

        match script_sig.last_push_if_push_only() {
            Some(redeem) => Script::from(redeem.to_vec()).sig_op_count(true),
            None => 0,
        }
    }

    /// OP_HASH160 <20 bytes> OP_EQUAL
    pub fn is_pay_to_script_hash(&self) -> bool {
        self.0.len() == 23 && self.0[0] == OP_HASH160 && self.0[1] == 0x14 && self.0[22] == OP_EQUAL
    }

    pub fn is_push_only(&self) -> bool {
        // Malformed pushes stop the iterator early, so also require full consumption
        self.instructions().all(|instruction| instruction.opcode <= OP_16) && self.is_well_formed()
    }

    /// Witness version and program, if this is a witness program
    pub fn witness_program(&self) -> Option<(u8, &[u8])> {
        let bytes = &self.0;
        if bytes.len() < 4 || bytes.len() > 42 {
            return None;
        }
        let version = match bytes[0] {
            OP_0 => 0,
            op @ OP_1..=OP_16 => op - OP_1 + 1,
            _ => return None,
        };
        if bytes[1] as usize + 2 == bytes.len() {
            Some((version, &bytes[2..]))
        } else {
            None
        }
    }

    /// Outputs with these scripts can never be spent and may be pruned
    pub fn is_unspendable(&self) -> bool {
        (!self.0.is_empty() && self.0[0] == OP_RETURN) || self.0.len() > MAX_SCRIPT_SIZE
    }

    /// The committed witness root, if this is a witness commitment output
    pub fn witness_commitment(&self) -> Option<[u8; 32]> {
        if self.0.len() >= 38 && self.0[..6] == WITNESS_COMMITMENT_HEADER {
            let mut commitment = [0u8; 32];
            commitment.copy_from_slice(&self.0[6..38]);
            Some(commitment)
        } else {
            None
        }
    }

    /// Checks the script starts with exactly the bytes of `prefix`
    pub fn starts_with(&self, prefix: &Script) -> bool {
        self.0.starts_with(&prefix.0)
    }

    fn is_well_formed(&self) -> bool {
        let mut walker = self.instructions();
        while walker.next().is_some() {}
        !walker.malformed
    }

    fn last_push_if_push_only(&self) -> Option<&[u8]> {
        if !self.is_push_only() {
            return None;
        }
        self.instructions().last().and_then(|instruction| instruction.data)
    }
}

/// Witness sig-op cost for one input
pub fn witness_sig_op_count(script_sig: &Script, script_pubkey: &Script, witness: &[Vec<u8>]) -> u32 {
    if let Some((version, program)) = script_pubkey.witness_program() {
        return program_sig_ops(version, program, witness);
    }

    if script_pubkey.is_pay_to_script_hash() {
        if let Some(redeem) = script_sig.last_push_if_push_only() {
            let redeem = Script::from(redeem.to_vec());
            if let Some((version, program)) = redeem.witness_program() {
                return program_sig_ops(version, program, witness);
            }
        }
    }

    0
}

fn program_sig_ops(version: u8, program: &[u8], witness: &[Vec<u8>]) -> u32 {
    if version != 0 {
        return 0;
    }
    match (program.len(), witness.last()) {
        (20, _) => 1,
        (32, Some(witness_script)) => Script::from(witness_script.clone()).sig_op_count(true),
        _ => 0,
    }
}

/// Minimal little-endian sign-magnitude encoding of a script number
fn encode_script_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }

    let negative = n < 0;
    let mut magnitude = n.unsigned_abs();
    let mut result = Vec::new();
    while magnitude > 0 {
        result.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }

    // The top bit carries the sign
    if let Some(last) = result.last_mut() {
        if *last & 0x80 != 0 {
            result.push(if negative { 0x80 } else { 0x00 });
        } else if negative {
            *last |= 0x80;
        }
    }
    result
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Script {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Script {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Script {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        hex::decode(s).map(Script).map_err(serde::de::Error::custom)
    }
}
