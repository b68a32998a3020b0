pub const FIN_MASK: u8 = 0b1000_0000;
pub const RSV_MASK: u8 = 0b0111_0000;
pub const OP_CODE_MASK: u8 = 0b0000_1111;
pub const MASK_MASK: u8 = 0b1000_0000;
pub const PAYLOAD_LENGTH_MASK: u8 = 0b0111_1111;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Marker value selecting a two byte extended payload length.
pub const PAYLOAD_LENGTH_16: u8 = 126;
/// Marker value selecting an eight byte extended payload length.
pub const PAYLOAD_LENGTH_64: u8 = 127;
