/// View over one bitmap block. Bit `i` lives in byte `i / 8`, position
/// `i % 8` (LSB first), as ext2 lays it out.
pub struct Bitmap<'a> {
    bytes: &'a mut [u8],
    /// Number of meaningful bits; anything past it is padding.
    limit: usize,
}

impl<'a> Bitmap<'a> {
    pub fn new(bytes: &'a mut [u8], limit: usize) -> Self {
        let limit = core::cmp::min(limit, bytes.len() * 8);
        Self { bytes, limit }
    }

    pub fn is_set(&self, bit: usize) -> bool {
        bit < self.limit && self.bytes[bit / 8] & (1u8 << (bit % 8)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        self.bytes[bit / 8] |= 1u8 << (bit % 8);
    }

    pub fn clear(&mut self, bit: usize) {
        self.bytes[bit / 8] &= !(1u8 << (bit % 8));
    }

    pub fn first_zero(&self) -> Option<usize> {
        let full_bytes = self.limit.div_ceil(8);
        for (byte_index, b) in self.bytes.iter().enumerate().take(full_bytes) {
            if *b == 0xFF {
                continue;
            }
            for bit in 0..8 {
                let bit_index = byte_index * 8 + bit;
                if bit_index >= self.limit {
                    return None;
                }
                if *b & (1u8 << bit) == 0 {
                    return Some(bit_index);
                }
            }
        }
        None
    }

    pub fn count_zeros(&self) -> usize {
        (0..self.limit).filter(|&bit| !self.is_set(bit)).count()
    }
}
