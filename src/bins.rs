pub(crate) trait SliceExt {
    fn read_u16(&self) -> u16;
    fn read_u32(&self) -> u32;
    fn read_u64(&self) -> u64;

    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
}

impl SliceExt for [u8] {
    fn read_u16(&self) -> u16 {
        u16::from_be_bytes(self[..2].try_into().unwrap())
    }
    fn read_u32(&self) -> u32 {
        u32::from_be_bytes(self[..4].try_into().unwrap())
    }
    fn read_u64(&self) -> u64 {
        u64::from_be_bytes(self[..8].try_into().unwrap())
    }

    fn put_u16(&mut self, v: u16) {
        self[..2].copy_from_slice(&v.to_be_bytes());
    }
    fn put_u32(&mut self, v: u32) {
        self[..4].copy_from_slice(&v.to_be_bytes());
    }
    fn put_u64(&mut self, v: u64) {
        self[..8].copy_from_slice(&v.to_be_bytes());
    }
}

pub(crate) fn pad8(size: usize) -> usize {
    (size + 7) & !7
}
