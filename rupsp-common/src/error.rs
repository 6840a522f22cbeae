// SPDX-FileCopyrightText: 2025 rupsp contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// PSP kernel result code.
/// Layout: bit 31 = error, bits [27:16] = facility, bits [15:0] = code.
/// Value 0 = success.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: Self = Self(0);

    /// Create an error code from facility and code.
    #[inline]
    pub const fn new(facility: u32, code: u32) -> Self {
        Self(0x8000_0000 | ((facility & 0xFFF) << 16) | (code & 0xFFFF))
    }

    /// Extract the facility number.
    #[inline]
    pub const fn facility(self) -> u32 {
        (self.0 >> 16) & 0xFFF
    }

    /// Extract the code within the facility.
    #[inline]
    pub const fn code(self) -> u32 {
        self.0 & 0xFFFF
    }

    /// Check if this is a success result.
    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Check if this is an error result.
    #[inline]
    pub const fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Raw u32 value, as seen by the guest in v0.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            write!(f, "ResultCode::SUCCESS")
        } else {
            write!(
                f,
                "ResultCode(facility={}, code=0x{:X}, raw=0x{:08X})",
                self.facility(),
                self.code(),
                self.0
            )
        }
    }
}

impl std::error::Error for ResultCode {}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            write!(f, "Success")
        } else {
            write!(f, "Error(0x{:08X})", self.0)
        }
    }
}

/// PSP error facilities.
pub mod facility {
    pub const KERNEL: u32 = 2;
}

const fn kernel(code: u32) -> ResultCode {
    ResultCode::new(facility::KERNEL, code)
}

// Kernel error codes (flat at module level for easy import).
pub const ERROR: ResultCode = kernel(0x0001);
pub const ILLEGAL_CONTEXT: ResultCode = kernel(0x0064);
pub const CPUDI: ResultCode = kernel(0x0066);
pub const ILLEGAL_ADDRESS: ResultCode = kernel(0x006A);
pub const ILLEGAL_ARGUMENT: ResultCode = kernel(0x00D2);
pub const ILLEGAL_ADDR: ResultCode = kernel(0x00D3);
pub const NO_MEMORY: ResultCode = kernel(0x0190);
pub const ILLEGAL_ATTR: ResultCode = kernel(0x0191);
pub const ILLEGAL_ENTRY: ResultCode = kernel(0x0192);
pub const ILLEGAL_PRIORITY: ResultCode = kernel(0x0193);
pub const ILLEGAL_STACK_SIZE: ResultCode = kernel(0x0194);
pub const ILLEGAL_MODE: ResultCode = kernel(0x0195);
pub const ILLEGAL_MASK: ResultCode = kernel(0x0196);
pub const ILLEGAL_THID: ResultCode = kernel(0x0197);
pub const UNKNOWN_THID: ResultCode = kernel(0x0198);
pub const UNKNOWN_TEID: ResultCode = kernel(0x01A0);
pub const UNKNOWN_CBID: ResultCode = kernel(0x01A1);
pub const DORMANT: ResultCode = kernel(0x01A2);
pub const SUSPEND: ResultCode = kernel(0x01A3);
pub const NOT_DORMANT: ResultCode = kernel(0x01A4);
pub const NOT_SUSPEND: ResultCode = kernel(0x01A5);
pub const NOT_WAIT: ResultCode = kernel(0x01A6);
pub const CAN_NOT_WAIT: ResultCode = kernel(0x01A7);
pub const WAIT_TIMEOUT: ResultCode = kernel(0x01A8);
pub const WAIT_CANCEL: ResultCode = kernel(0x01A9);
pub const RELEASE_WAIT: ResultCode = kernel(0x01AA);
pub const NOTIFY_CALLBACK: ResultCode = kernel(0x01AB);
pub const THREAD_TERMINATED: ResultCode = kernel(0x01AC);
pub const WAIT_DELETE: ResultCode = kernel(0x01B5);
pub const ILLEGAL_TYPE: ResultCode = kernel(0x01BB);
pub const ILLEGAL_SIZE: ResultCode = kernel(0x01BC);

/// Bare -1, returned by the few calls that do not use a kernel error code.
pub const FAILURE: ResultCode = ResultCode(0xFFFF_FFFF);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code() {
        assert_eq!(ILLEGAL_THID.raw(), 0x8002_0197);
        assert_eq!(ILLEGAL_THID.facility(), facility::KERNEL);
        assert_eq!(ILLEGAL_THID.code(), 0x197);
        assert!(ILLEGAL_THID.is_error());
        assert!(!ILLEGAL_THID.is_success());
    }

    #[test]
    fn test_success() {
        assert!(ResultCode::SUCCESS.is_success());
        assert_eq!(ResultCode::SUCCESS.raw(), 0);
    }

    #[test]
    fn test_known_values() {
        assert_eq!(NOT_DORMANT.raw(), 0x8002_01A4);
        assert_eq!(WAIT_TIMEOUT.raw(), 0x8002_01A8);
        assert_eq!(ILLEGAL_ADDR.raw(), 0x8002_00D3);
        assert_eq!(FAILURE.raw() as i32, -1);
    }
}
