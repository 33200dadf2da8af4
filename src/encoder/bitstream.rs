//! RBSP bit writer and NAL framing

/// Four-byte Annex-B start code
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// MSB-first bit writer for raw byte sequence payloads
#[derive(Debug, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    acc: u8,
    bits: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            acc: 0,
            bits: 0,
        }
    }

    pub fn put_bit(&mut self, bit: bool) {
        self.acc = (self.acc << 1) | bit as u8;
        self.bits += 1;
        if self.bits == 8 {
            self.buf.push(self.acc);
            self.acc = 0;
            self.bits = 0;
        }
    }

    /// Write the low `count` bits of `value`, most significant first
    pub fn put_bits(&mut self, value: u32, count: u8) {
        debug_assert!(count <= 32);
        for i in (0..count).rev() {
            self.put_bit((value >> i) & 1 == 1);
        }
    }

    /// Unsigned Exp-Golomb, ue(v)
    pub fn put_ue(&mut self, value: u32) {
        let coded = value as u64 + 1;
        let len = 64 - coded.leading_zeros() as u8;
        for _ in 0..len - 1 {
            self.put_bit(false);
        }
        for i in (0..len).rev() {
            self.put_bit((coded >> i) & 1 == 1);
        }
    }

    /// Signed Exp-Golomb, se(v)
    pub fn put_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.put_ue(mapped);
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bits == 0
    }

    /// Pad with zero bits up to the next byte boundary
    pub fn align_zero(&mut self) {
        while !self.is_byte_aligned() {
            self.put_bit(false);
        }
    }

    /// Append whole bytes; the writer must be byte aligned
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.is_byte_aligned());
        self.buf.extend_from_slice(bytes);
    }

    /// rbsp_trailing_bits(): a stop bit then zero alignment
    pub fn finish_rbsp(mut self) -> Vec<u8> {
        self.put_bit(true);
        self.align_zero();
        self.buf
    }

    /// Bytes written so far, including a partial byte
    pub fn len(&self) -> usize {
        self.buf.len() + usize::from(self.bits > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frame an RBSP as a start-code-prefixed NAL unit, inserting
/// emulation-prevention bytes where needed
pub fn write_nal(out: &mut Vec<u8>, header: &[u8], rbsp: &[u8]) {
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(header);
    let mut zeros = 0usize;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(byte);
        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
    }
}
