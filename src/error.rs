/// Errors produced by the protocol layers of this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Payload too short: got {got} bytes, need at least {need}")]
    PayloadTooShort { got: usize, need: usize },
    #[error("Cell count {0} exceeds the {max} cells this protocol carries", max = crate::snapshot::MAX_CELLS)]
    CellCountOutOfRange(u8),
    #[error("CRC mismatch - calculated={calculated:04X} received={received:04X}")]
    CrcMismatch { calculated: u16, received: u16 },
    #[error("Frame checksum mismatch - calculated={calculated:08X} received={received:08X}")]
    ChecksumMismatch { calculated: u32, received: u32 },
    #[error("Unexpected frame marker {0:02X?}")]
    BadFrameMarker([u8; 2]),
    #[error("Unsupported register address {0:#06X}")]
    UnsupportedAddress(u16),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
