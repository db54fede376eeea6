//! Registration of user-defined function codes.
//!
//! Built-in function codes are decoded exhaustively by `mbsrv_protocol`. A
//! registered [`CustomFunction`] extends the framers' expected-length tables
//! so that frames carrying its code can be delimited on serial framings; the
//! PDU body itself travels as the opaque `Custom` request/response variant.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use mbsrv_protocol::{codec, function_codes, Error, Result};

/// Length hooks for one custom function code. `data` starts at the function
/// code byte; `None` means the prefix does not determine the length yet.
pub trait CustomFunction: Send + Sync {
    fn function_code(&self) -> u8;
    fn request_pdu_len(&self, data: &[u8]) -> Result<Option<usize>>;
    fn response_pdu_len(&self, data: &[u8]) -> Result<Option<usize>>;
}

/// A custom function whose request and response PDUs have fixed sizes, which
/// covers most vendor-specific codes.
pub struct FixedLengthFunction {
    code: u8,
    request_len: usize,
    response_len: usize,
}

impl FixedLengthFunction {
    pub fn new(code: u8, request_len: usize, response_len: usize) -> Self {
        Self {
            code,
            request_len,
            response_len,
        }
    }
}

impl CustomFunction for FixedLengthFunction {
    fn function_code(&self) -> u8 {
        self.code
    }

    fn request_pdu_len(&self, _data: &[u8]) -> Result<Option<usize>> {
        Ok(Some(self.request_len))
    }

    fn response_pdu_len(&self, _data: &[u8]) -> Result<Option<usize>> {
        Ok(Some(self.response_len))
    }
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    entries: HashMap<u8, Arc<dyn CustomFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a custom function code. Codes claimed by the built-in codec
    /// and codes with the exception flag set are rejected.
    pub fn register(&mut self, function: Arc<dyn CustomFunction>) -> Result<()> {
        let code = function.function_code();
        if code & function_codes::EXCEPTION_FLAG != 0 {
            return Err(Error::invalid_request(anyhow!(
                "function code 0x{:02X} collides with the exception flag",
                code
            )));
        }
        if codec::request_pdu_len(&[code]).is_ok() {
            return Err(Error::invalid_request(anyhow!(
                "function code 0x{:02X} is built in",
                code
            )));
        }
        if self.entries.insert(code, function).is_some() {
            return Err(Error::invalid_request(anyhow!(
                "function code 0x{:02X} registered twice",
                code
            )));
        }
        Ok(())
    }

    pub fn get(&self, code: u8) -> Option<&Arc<dyn CustomFunction>> {
        self.entries.get(&(code & !function_codes::EXCEPTION_FLAG))
    }

    pub fn contains(&self, code: u8) -> bool {
        self.entries
            .contains_key(&(code & !function_codes::EXCEPTION_FLAG))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_custom_code() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(Arc::new(FixedLengthFunction::new(0x44, 5, 7)))
            .unwrap();
        assert!(registry.contains(0x44));
        assert!(registry.contains(0x44 | 0x80));
        assert_eq!(
            registry
                .get(0x44)
                .unwrap()
                .response_pdu_len(&[0x44])
                .unwrap(),
            Some(7)
        );
    }

    #[test]
    fn test_builtin_codes_rejected() {
        let mut registry = FunctionRegistry::new();
        assert!(registry
            .register(Arc::new(FixedLengthFunction::new(3, 5, 5)))
            .is_err());
        assert!(registry
            .register(Arc::new(FixedLengthFunction::new(0x83, 2, 2)))
            .is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = FunctionRegistry::new();
        registry
            .register(Arc::new(FixedLengthFunction::new(0x44, 5, 7)))
            .unwrap();
        assert!(registry
            .register(Arc::new(FixedLengthFunction::new(0x44, 5, 7)))
            .is_err());
    }
}
