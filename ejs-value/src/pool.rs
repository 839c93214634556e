//! `ConstantPool` (spec §3/§6.1): a contiguous NUL-terminated UTF-8 buffer
//! that every string/name in a module references by byte offset ("token").

use crate::error::{EjsError, Result};

#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    bytes: Vec<u8>,
}

impl ConstantPool {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ConstantPool { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Reads the NUL-terminated UTF-8 string starting at `token`.
    pub fn str_at(&self, token: usize) -> Result<&str> {
        if token >= self.bytes.len() {
            return Err(EjsError::OutOfBounds(format!(
                "constant pool token {token} out of range ({})",
                self.bytes.len()
            )));
        }
        let end = self.bytes[token..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| EjsError::Io("unterminated string in constant pool".into()))?;
        std::str::from_utf8(&self.bytes[token..token + end])
            .map_err(|e| EjsError::Io(format!("invalid utf8 in constant pool: {e}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_nul_terminated_strings() {
        let mut bytes = b"hello\0world\0".to_vec();
        bytes.extend_from_slice(b"ejs\0");
        let pool = ConstantPool::from_bytes(bytes);
        assert_eq!(pool.str_at(0).unwrap(), "hello");
        assert_eq!(pool.str_at(6).unwrap(), "world");
        assert_eq!(pool.str_at(12).unwrap(), "ejs");
    }

    #[test]
    fn out_of_range_token_errors() {
        let pool = ConstantPool::from_bytes(b"hi\0".to_vec());
        assert!(pool.str_at(100).is_err());
    }
}
