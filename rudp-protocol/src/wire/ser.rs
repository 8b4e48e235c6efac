use anyhow::Result;

pub type SerializeResult = Result<()>;

pub trait Serializer {
    // Write bytes
    fn write_bytes(&mut self, fragment: &[u8]) -> SerializeResult;
}

/// Serialize a packet to a growable buffer
pub struct VecSerializer {
    data: Vec<u8>,
}

impl VecSerializer {
    pub fn new(initial_capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(initial_capacity),
        }
    }

    pub fn take(self) -> Vec<u8> {
        self.data
    }
}

impl Serializer for VecSerializer {
    fn write_bytes(&mut self, fragment: &[u8]) -> SerializeResult {
        self.data.extend_from_slice(fragment);
        Ok(())
    }
}

pub trait Serialize {
    type Input;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult;
}

impl Serialize for u8 {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        ser.write_bytes(&value.to_be_bytes())
    }
}

impl Serialize for u16 {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        ser.write_bytes(&value.to_be_bytes())
    }
}

impl Serialize for u32 {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        ser.write_bytes(&value.to_be_bytes())
    }
}

impl Serialize for u64 {
    type Input = Self;
    fn serialize<S: Serializer>(value: &Self::Input, ser: &mut S) -> SerializeResult {
        ser.write_bytes(&value.to_be_bytes())
    }
}
