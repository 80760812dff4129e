//! vmnet status codes.

use serde::{Deserialize, Serialize};
use vmbridge_core::error::{BridgeError, Result};

/// Status returned by every datapath and network-configuration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum VmnetReturn {
    Success = 1000,
    Failure = 1001,
    MemFailure = 1002,
    InvalidArgument = 1003,
    SetupIncomplete = 1004,
    InvalidAccess = 1005,
    PacketTooBig = 1006,
    BufferExhausted = 1007,
    TooManyPackets = 1008,
    SharingServiceBusy = 1009,
    NotAuthorized = 1010,
}

impl VmnetReturn {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let status = match code {
            1000 => VmnetReturn::Success,
            1001 => VmnetReturn::Failure,
            1002 => VmnetReturn::MemFailure,
            1003 => VmnetReturn::InvalidArgument,
            1004 => VmnetReturn::SetupIncomplete,
            1005 => VmnetReturn::InvalidAccess,
            1006 => VmnetReturn::PacketTooBig,
            1007 => VmnetReturn::BufferExhausted,
            1008 => VmnetReturn::TooManyPackets,
            1009 => VmnetReturn::SharingServiceBusy,
            1010 => VmnetReturn::NotAuthorized,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_success(self) -> bool {
        self == VmnetReturn::Success
    }

    /// The datapath has nothing to give or no room to take right now.
    pub fn is_would_block(self) -> bool {
        self == VmnetReturn::BufferExhausted
    }

    pub fn message(self) -> &'static str {
        match self {
            VmnetReturn::Success => "Vmnet: Successfully completed",
            VmnetReturn::Failure => "Vmnet: Failure",
            VmnetReturn::MemFailure => "Vmnet: Memory allocation failure",
            VmnetReturn::InvalidArgument => "Vmnet: Invalid argument specified",
            VmnetReturn::SetupIncomplete => "Vmnet: Interface setup is not complete",
            VmnetReturn::InvalidAccess => "Vmnet: Permission denied",
            VmnetReturn::PacketTooBig => "Vmnet: Packet size larger than MTU",
            VmnetReturn::BufferExhausted => "Vmnet: Buffers exhausted in kernel",
            VmnetReturn::TooManyPackets => "Vmnet: Packet count exceeds limit",
            VmnetReturn::SharingServiceBusy => {
                "Vmnet: Vmnet Interface cannot be started as conflicting sharing service is in use"
            }
            VmnetReturn::NotAuthorized => {
                "Vmnet: The operation could not be completed due to missing authorization"
            }
        }
    }

    /// `Ok` on success, otherwise `OperationFailed` naming `operation`.
    pub fn into_result(self, operation: &str) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(BridgeError::failed_with(format!("{operation} failed"), self))
        }
    }
}

impl std::fmt::Display for VmnetReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for VmnetReturn {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in 1000..=1010 {
            let status = VmnetReturn::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert_eq!(VmnetReturn::from_code(999), None);
    }

    #[test]
    fn test_into_result_carries_cause() {
        assert!(VmnetReturn::Success.into_result("write").is_ok());
        match VmnetReturn::PacketTooBig.into_result("write").unwrap_err() {
            BridgeError::OperationFailed { description, cause } => {
                assert_eq!(description, "write failed");
                assert_eq!(cause.as_deref(), Some("Vmnet: Packet size larger than MTU"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
