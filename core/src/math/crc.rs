//! CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection, no final xor).

const POLY: u16 = 0x1021;

const CRC16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental checksum over several slices.
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Crc16 {
    pub const fn new() -> Self {
        Self(0xFFFF)
    }

    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let idx = ((self.0 >> 8) ^ u16::from(byte)) & 0xFF;
            self.0 = (self.0 << 8) ^ CRC16_TABLE[idx as usize];
        }
    }

    pub const fn finish(self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(data);
    crc.finish()
}
