use anyhow::bail;

#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("Datagram too short: {0} bytes")]
    Truncated(usize),
    #[error("Unknown command code: {0:#04x}")]
    UnknownCommand(u8),
    #[error("EOF during deserialization")]
    Eof, // Data ended prematurely
}

pub type DeserializeResult<R> = anyhow::Result<R>;

pub struct Deserializer<'a> {
    pub data: &'a [u8], // Remaining data
}

impl<'a> Deserializer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn peek(&mut self, count: usize) -> DeserializeResult<&'a [u8]> {
        if count > self.data.len() {
            bail!(DeserializeError::Eof)
        } else {
            Ok(&self.data[0..count])
        }
    }

    pub fn take(&mut self, count: usize) -> DeserializeResult<&'a [u8]> {
        if count > self.data.len() {
            bail!(DeserializeError::Eof)
        } else {
            let ret;
            (ret, self.data) = self.data.split_at(count);
            Ok(ret)
        }
    }

    pub fn take_n<const N: usize>(&mut self) -> DeserializeResult<[u8; N]> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    pub fn take_all(&mut self) -> &'a [u8] {
        let ret;
        (ret, self.data) = self.data.split_at(self.data.len());
        ret
    }
}

pub trait Deserialize {
    type Output;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self::Output>;
}

impl Deserialize for u8 {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(u8::from_be_bytes(deser.take_n::<1>()?))
    }
}

impl Deserialize for u16 {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(u16::from_be_bytes(deser.take_n::<2>()?))
    }
}

impl Deserialize for u32 {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(u32::from_be_bytes(deser.take_n::<4>()?))
    }
}

impl Deserialize for u64 {
    type Output = Self;
    fn deserialize(deser: &mut Deserializer) -> DeserializeResult<Self> {
        Ok(u64::from_be_bytes(deser.take_n::<8>()?))
    }
}
