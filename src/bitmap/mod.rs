// Paged customer-id bitmaps.
//
// A bitmap is a growable sequence of fixed pages (510 x u64, ~4080 bytes
// of data each). Logical operations run word-wise with popcount; the
// stored form is a chain of per-page LZ4 records so cold partitions cost
// only their compressed footprint. Bits past the customer count are
// undefined - every population or iteration call takes an explicit stop
// bit (NOT flips the whole buffer, so trailing garbage is real).

mod lru;

pub use lru::IndexLru;

use crate::error::{Error, Result};

/// Words per page. 510 * 8 bytes keeps a page at ~4 KiB with its flags.
pub const BIT_ARRAY_SIZE: usize = 510;
pub const BITS_PER_PAGE: usize = BIT_ARRAY_SIZE * 64;
const PAGE_DATA_BYTES: usize = BIT_ARRAY_SIZE * 8;

// stored-page record header: page index + compressed length
const PAGE_HEADER_BYTES: usize = 8;

#[derive(Debug)]
struct Page {
    dirty: bool,
    words: Box<[u64; BIT_ARRAY_SIZE]>,
}

impl Page {
    fn zeroed() -> Self {
        Self {
            dirty: false,
            words: Box::new([0u64; BIT_ARRAY_SIZE]),
        }
    }

    fn population(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PAGE_DATA_BYTES);
        for word in self.words.iter() {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_DATA_BYTES {
            return Err(Error::corruption("bitmap page has wrong length"));
        }
        let mut page = Page::zeroed();
        for (i, chunk) in bytes.chunks_exact(8).enumerate() {
            page.words[i] = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(page)
    }
}

/// A growable bitmap addressed by customer linear id.
#[derive(Default, Debug)]
pub struct IndexBits {
    pages: Vec<Page>,
    pub placeholder: bool,
}

impl Clone for IndexBits {
    fn clone(&self) -> Self {
        let mut copy = IndexBits::default();
        copy.op_copy(self);
        copy
    }
}

impl IndexBits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.pages.clear();
        self.placeholder = false;
    }

    /// Number of u64 words currently backing the bitmap.
    pub fn word_count(&self) -> usize {
        self.pages.len() * BIT_ARRAY_SIZE
    }

    fn ensure_page(&mut self, page_index: usize) {
        while self.pages.len() <= page_index {
            self.pages.push(Page::zeroed());
        }
    }

    fn word(&self, word_index: usize) -> u64 {
        let page = word_index / BIT_ARRAY_SIZE;
        if page >= self.pages.len() {
            return 0;
        }
        self.pages[page].words[word_index % BIT_ARRAY_SIZE]
    }

    fn word_mut(&mut self, word_index: usize) -> &mut u64 {
        let page = word_index / BIT_ARRAY_SIZE;
        self.ensure_page(page);
        self.pages[page].dirty = true;
        &mut self.pages[page].words[word_index % BIT_ARRAY_SIZE]
    }

    /// Grow the page table so at least `words` u64s exist.
    pub fn grow(&mut self, words: usize) {
        if words == 0 {
            return;
        }
        self.ensure_page((words - 1) / BIT_ARRAY_SIZE);
    }

    /// Grow the bitmap so the page containing `bit` exists.
    pub fn set_size_by_bit(&mut self, bit: usize) {
        self.ensure_page(bit / BITS_PER_PAGE);
    }

    /// Build a bitmap of `count` bits, all set to `state`. When `state` is
    /// on, bits past `count` in the final word are cleared back to zero.
    pub fn make_bits(&mut self, count: usize, state: bool) {
        self.reset();
        if count == 0 && !state {
            return;
        }
        let last_word = count / 64;
        for i in 0..=last_word {
            *self.word_mut(i) = if state { u64::MAX } else { 0 };
        }
        if state {
            let end = self.word_count() * 64;
            for bit in count..end {
                self.bit_clear(bit);
            }
        }
    }

    pub fn bit_set(&mut self, bit: usize) {
        *self.word_mut(bit / 64) |= 1u64 << (bit % 64);
    }

    pub fn bit_clear(&mut self, bit: usize) {
        *self.word_mut(bit / 64) &= !(1u64 << (bit % 64));
    }

    pub fn bit_state(&self, bit: usize) -> bool {
        self.word(bit / 64) & (1u64 << (bit % 64)) != 0
    }

    /// Count set bits below `stop_bit`. The stop bit matters: buffers are
    /// longer than the customer count and NOT fills the overhang.
    pub fn population(&self, stop_bit: usize) -> u64 {
        let last_word = stop_bit / 64;
        let mut count: u64 = 0;
        for i in 0..last_word {
            count += self.word(i).count_ones() as u64;
        }
        for bit in (last_word * 64)..stop_bit {
            if self.bit_state(bit) {
                count += 1;
            }
        }
        count
    }

    pub fn op_copy(&mut self, source: &IndexBits) {
        self.reset();
        self.placeholder = source.placeholder;
        for src in &source.pages {
            let mut page = Page::zeroed();
            page.words.copy_from_slice(&src.words[..]);
            page.dirty = true;
            self.pages.push(page);
        }
    }

    pub fn op_copy_not(&mut self, source: &IndexBits) {
        self.op_copy(source);
        self.op_not();
    }

    pub fn op_and(&mut self, source: &IndexBits) {
        if self.placeholder || source.placeholder {
            return;
        }
        let end = self.word_count().max(source.word_count());
        for i in 0..end {
            let value = self.word(i) & source.word(i);
            *self.word_mut(i) = value;
        }
    }

    pub fn op_or(&mut self, source: &IndexBits) {
        if self.placeholder || source.placeholder {
            return;
        }
        let end = source.word_count();
        for i in 0..end {
            let value = self.word(i) | source.word(i);
            *self.word_mut(i) = value;
        }
    }

    pub fn op_and_not(&mut self, source: &IndexBits) {
        if self.placeholder || source.placeholder {
            return;
        }
        let end = self.word_count().max(source.word_count());
        for i in 0..end {
            let value = self.word(i) & !source.word(i);
            *self.word_mut(i) = value;
        }
    }

    pub fn op_not(&mut self) {
        if self.placeholder {
            return;
        }
        let end = self.word_count();
        for i in 0..end {
            let value = !self.word(i);
            *self.word_mut(i) = value;
        }
    }

    /// Advance to the next set bit at or after `*cursor + 1`, bounded by
    /// `stop_bit`. Start iteration with `cursor = -1`; returns false when
    /// exhausted. Skips empty words whole.
    pub fn linear_iter(&self, cursor: &mut i64, stop_bit: usize) -> bool {
        let mut bit = (*cursor + 1).max(0) as usize;
        let word_count = self.word_count();

        let mut word_index = bit / 64;
        while word_index < word_count {
            let word = self.word(word_index);
            if word != 0 {
                if bit >= stop_bit {
                    return false;
                }
                for i in (bit % 64)..64 {
                    if word & (1u64 << i) != 0 {
                        let found = word_index * 64 + i;
                        if found >= stop_bit {
                            return false;
                        }
                        *cursor = found as i64;
                        return true;
                    }
                }
            }
            word_index += 1;
            bit = word_index * 64;
        }
        false
    }

    /// Serialize to the stored form: a sequence of per-page records
    /// `(page_index: u32, comp_len: u32, lz4_bytes)`. Pages with zero
    /// population are skipped. Returns an empty buffer for an empty map.
    pub fn store(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for (index, page) in self.pages.iter_mut().enumerate() {
            page.dirty = false;
            if page.population() == 0 {
                continue;
            }
            let raw = page.to_bytes();
            let compressed = lz4_flex::block::compress(&raw);
            out.extend_from_slice(&(index as u32).to_le_bytes());
            out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
        }
        out
    }

    /// Rehydrate from the stored form produced by `store`.
    pub fn mount(&mut self, data: &[u8]) -> Result<()> {
        self.reset();
        let mut offset = 0usize;
        while offset + PAGE_HEADER_BYTES <= data.len() {
            let page_index =
                u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
            let comp_len =
                u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap()) as usize;
            offset += PAGE_HEADER_BYTES;

            if offset + comp_len > data.len() {
                return Err(Error::corruption("bitmap record truncated"));
            }
            let raw = lz4_flex::block::decompress(&data[offset..offset + comp_len], PAGE_DATA_BYTES)
                .map_err(|e| Error::corruption(format!("bitmap page: {e}")))?;
            offset += comp_len;

            self.ensure_page(page_index);
            self.pages[page_index] = Page::from_bytes(&raw)?;
        }
        if offset != data.len() {
            return Err(Error::corruption("bitmap trailing bytes"));
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.pages.iter().any(|p| p.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_test_clear() {
        let mut bits = IndexBits::new();
        bits.bit_set(3);
        bits.bit_set(100_000);
        assert!(bits.bit_state(3));
        assert!(bits.bit_state(100_000));
        assert!(!bits.bit_state(4));
        bits.bit_clear(3);
        assert!(!bits.bit_state(3));
        assert_eq!(bits.population(200_000), 1);
    }

    #[test]
    fn test_population_respects_stop_bit() {
        let mut bits = IndexBits::new();
        bits.make_bits(10, true);
        // everything past bit 10 was zeroed by make_bits
        assert_eq!(bits.population(10), 10);
        assert_eq!(bits.population(5), 5);

        bits.op_not();
        // after NOT the overhang is all ones; stop bit keeps the count honest
        assert_eq!(bits.population(10), 0);
    }

    #[test]
    fn test_and_or_and_not() {
        let mut a = IndexBits::new();
        let mut b = IndexBits::new();
        a.bit_set(1);
        a.bit_set(2);
        b.bit_set(2);
        b.bit_set(3);

        let mut and = a.clone();
        and.op_and(&b);
        assert_eq!(and.population(64), 1);
        assert!(and.bit_state(2));

        let mut or = a.clone();
        or.op_or(&b);
        assert_eq!(or.population(64), 3);

        let mut diff = a.clone();
        diff.op_and_not(&b);
        assert!(diff.bit_state(1));
        assert!(!diff.bit_state(2));
    }

    #[test]
    fn test_linear_iter_skips_words() {
        let mut bits = IndexBits::new();
        for bit in [0usize, 63, 64, 9_000, 32_639, 32_640] {
            bits.bit_set(bit);
        }
        let mut found = Vec::new();
        let mut cursor = -1i64;
        while bits.linear_iter(&mut cursor, 40_000) {
            found.push(cursor as usize);
        }
        assert_eq!(found, vec![0, 63, 64, 9_000, 32_639, 32_640]);

        // stop bit trims the tail
        let mut cursor = -1i64;
        let mut found = Vec::new();
        while bits.linear_iter(&mut cursor, 65) {
            found.push(cursor as usize);
        }
        assert_eq!(found, vec![0, 63, 64]);
    }

    #[test]
    fn test_store_mount_round_trip() {
        let mut bits = IndexBits::new();
        for bit in [7usize, 511, 32_700, 70_000] {
            bits.bit_set(bit);
        }
        let stored = bits.store();

        let mut mounted = IndexBits::new();
        mounted.mount(&stored).unwrap();
        for bit in [7usize, 511, 32_700, 70_000] {
            assert!(mounted.bit_state(bit), "bit {bit} lost in round trip");
        }
        assert_eq!(mounted.population(70_001), 4);
    }

    #[test]
    fn test_store_skips_empty_pages() {
        let mut bits = IndexBits::new();
        bits.bit_set(0);
        bits.bit_set(BITS_PER_PAGE * 3); // pages 1..2 stay empty
        let stored = bits.store();

        let mut mounted = IndexBits::new();
        mounted.mount(&stored).unwrap();
        assert!(mounted.bit_state(0));
        assert!(mounted.bit_state(BITS_PER_PAGE * 3));
        assert_eq!(mounted.population(BITS_PER_PAGE * 4), 2);
    }

    #[test]
    fn test_mount_rejects_garbage() {
        let mut bits = IndexBits::new();
        assert!(bits.mount(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).is_err());
    }

    #[test]
    fn test_placeholder_ops_are_inert() {
        let mut a = IndexBits::new();
        a.placeholder = true;
        let mut b = IndexBits::new();
        b.bit_set(5);
        a.op_or(&b);
        assert_eq!(a.population(64), 0);
    }
}
