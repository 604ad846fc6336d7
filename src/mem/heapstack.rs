const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Bump-allocated chain of blocks for building serialized output.
///
/// Writers append with `write`/`write_*`; `flatten` materializes the whole
/// chain as one contiguous buffer. Appending never moves previously
/// written bytes, so block growth is cheap mid-serialization.
pub struct HeapStack {
    blocks: Vec<Vec<u8>>,
    block_size: usize,
    length: usize,
}

impl Default for HeapStack {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapStack {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            blocks: vec![Vec::with_capacity(block_size)],
            block_size,
            length: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn write(&mut self, mut bytes: &[u8]) {
        self.length += bytes.len();
        while !bytes.is_empty() {
            let last = self.blocks.last_mut().expect("at least one block");
            let room = self.block_size - last.len();
            if room == 0 {
                self.blocks.push(Vec::with_capacity(self.block_size));
                continue;
            }
            let take = room.min(bytes.len());
            last.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write(&[value]);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write(&value.to_le_bytes());
    }

    pub fn flatten(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_spanning_blocks() {
        let mut hs = HeapStack::with_block_size(8);
        hs.write(b"0123456789abcdef");
        hs.write_u8(b'!');
        assert_eq!(hs.len(), 17);
        assert_eq!(hs.flatten(), b"0123456789abcdef!");
    }

    #[test]
    fn test_numeric_writes_little_endian() {
        let mut hs = HeapStack::new();
        hs.write_i64(0x0102);
        hs.write_i32(-1);
        let flat = hs.flatten();
        assert_eq!(flat.len(), 12);
        assert_eq!(i64::from_le_bytes(flat[0..8].try_into().unwrap()), 0x0102);
    }
}
