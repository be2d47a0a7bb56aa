// Feetech STS-series serial bus protocol
//
// Frame layout (both directions):
//   [0xFF, 0xFF, id, length, instruction | status, params..., checksum]
// length counts instruction/status + params + checksum.
// checksum = !(id + length + instruction/status + params) & 0xFF

use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Encoder resolution of the STS servos
pub const STEPS_PER_REVOLUTION: u16 = 4096;

/// Largest goal velocity we send, steps/s
pub const MAX_GOAL_VELOCITY: i16 = 3000;

/// Protection current register unit, amps
pub const CURRENT_UNIT_AMPS: f64 = 0.0065;

const HEADER: [u8; 2] = [0xFF, 0xFF];

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Control table addresses used by the drivebase
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    // EEPROM (needs Lock = 0 to write)
    ProtectionCurrent = 28, // 2 bytes, 6.5 mA units
    OperatingMode = 33,     // 1 byte

    // RAM
    TorqueEnable = 40,    // 1 byte
    GoalPosition = 42,    // 2 bytes
    GoalVelocity = 46,    // 2 bytes, sign-magnitude
    Lock = 55,            // 1 byte
    PresentPosition = 56, // 2 bytes
    PresentVelocity = 58, // 2 bytes, sign-magnitude
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
}

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from servo {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for servo {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Servo {id} returned error status: 0x{status:02X}")]
    ServoError { id: u8, status: u8 },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
    !(sum as u8)
}

/// Build an instruction frame
pub fn encode_frame(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + params.len());
    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push((params.len() + 2) as u8);
    frame.push(instruction as u8);
    frame.extend_from_slice(params);
    frame.push(checksum(&frame[2..]));
    frame
}

/// Validate a complete status frame and return its parameters
pub fn decode_status(expected_id: u8, frame: &[u8]) -> Result<Vec<u8>> {
    let invalid = |reason: String| FeetechError::InvalidResponse {
        id: expected_id,
        reason,
    };

    if frame.len() < 6 {
        return Err(invalid(format!("Frame too short: {} bytes", frame.len())));
    }
    if frame[..2] != HEADER {
        return Err(invalid(format!("Invalid header: {:02X?}", &frame[..2])));
    }

    let id = frame[2];
    let length = frame[3] as usize;
    if id != expected_id {
        return Err(invalid(format!("ID mismatch: expected {}, got {}", expected_id, id)));
    }
    if frame.len() != 4 + length || length < 2 {
        return Err(invalid(format!(
            "Length field {} does not match frame of {} bytes",
            length,
            frame.len()
        )));
    }

    let (body, received) = frame[2..].split_at(frame.len() - 3);
    if checksum(body) != received[0] {
        return Err(FeetechError::ChecksumMismatch { id });
    }

    let status = frame[4];
    if status != 0 {
        return Err(FeetechError::ServoError { id, status });
    }

    Ok(frame[5..frame.len() - 1].to_vec())
}

/// Sign-magnitude: bit 15 is direction, bits 0-14 magnitude
pub fn encode_sign_magnitude(value: i16) -> u16 {
    let magnitude = value.unsigned_abs().min(0x7FFF);
    if value < 0 { 0x8000 | magnitude } else { magnitude }
}

pub fn decode_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}

/// A serial bus shared by several servos
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        Ok(Self { port })
    }

    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn receive(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; 4];
        self.port.read_exact(&mut frame).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        })?;

        let length = frame[3] as usize;
        frame.resize(4 + length, 0);
        self.port.read_exact(&mut frame[4..])?;

        decode_status(expected_id, &frame)
    }

    fn transact(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
        self.send(&encode_frame(id, instruction, params))?;
        self.receive(id)
    }

    pub fn ping(&mut self, id: u8) -> Result<bool> {
        match self.transact(id, Instruction::Ping, &[]) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn read(&mut self, id: u8, register: Register, len: u8) -> Result<Vec<u8>> {
        let data = self.transact(id, Instruction::Read, &[register as u8, len])?;
        if data.len() < len as usize {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", len, data.len()),
            });
        }
        Ok(data)
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let data = self.read(id, register, 2)?;
        Ok(u16::from_le_bytes([data[0], data[1]]))
    }

    pub fn write(&mut self, id: u8, register: Register, data: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(1 + data.len());
        params.push(register as u8);
        params.extend_from_slice(data);
        debug!("Write to servo {}: reg={:?}, data={:02X?}", id, register, data);
        self.transact(id, Instruction::Write, &params)?;
        Ok(())
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        self.write(id, register, &[value])
    }

    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        self.write(id, register, &value.to_le_bytes())
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, enabled as u8)
    }

    /// Switch operating mode; torque is dropped while the mode changes
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.set_torque(id, false)?;
        self.write_u8(id, Register::OperatingMode, mode as u8)?;
        self.set_torque(id, true)
    }

    pub fn set_protection_current(&mut self, id: u8, amps: f64) -> Result<()> {
        let units = (amps / CURRENT_UNIT_AMPS).round().clamp(0.0, u16::MAX as f64) as u16;
        self.write_u8(id, Register::Lock, 0)?;
        self.write_u16(id, Register::ProtectionCurrent, units)?;
        self.write_u8(id, Register::Lock, 1)
    }

    pub fn set_goal_velocity(&mut self, id: u8, steps_per_sec: i16) -> Result<()> {
        let clamped = steps_per_sec.clamp(-MAX_GOAL_VELOCITY, MAX_GOAL_VELOCITY);
        self.write_u16(id, Register::GoalVelocity, encode_sign_magnitude(clamped))
    }

    pub fn set_goal_position(&mut self, id: u8, step: u16) -> Result<()> {
        self.write_u16(id, Register::GoalPosition, step % STEPS_PER_REVOLUTION)
    }

    /// Single-turn position, 0..STEPS_PER_REVOLUTION
    pub fn present_position(&mut self, id: u8) -> Result<u16> {
        Ok(self.read_u16(id, Register::PresentPosition)? % STEPS_PER_REVOLUTION)
    }

    pub fn present_velocity(&mut self, id: u8) -> Result<i16> {
        Ok(decode_sign_magnitude(self.read_u16(id, Register::PresentVelocity)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        // ID=1, Length=4, WRITE, addr=30, data=0,2 -> ~40 = 215
        assert_eq!(checksum(&[1u8, 4, 0x03, 30, 0, 2]), 215);
    }

    #[test]
    fn test_encode_ping_frame() {
        let frame = encode_frame(1, Instruction::Ping, &[]);
        assert_eq!(frame, vec![0xFF, 0xFF, 1, 2, 0x01, !(1u8 + 2 + 1)]);
    }

    #[test]
    fn test_decode_status_returns_params() {
        // Servo 3 answering a 2-byte read with 0x0800 (2048)
        let mut frame = vec![0xFF, 0xFF, 3, 4, 0x00, 0x00, 0x08];
        let sum = checksum(&frame[2..]);
        frame.push(sum);
        assert_eq!(decode_status(3, &frame).unwrap(), vec![0x00, 0x08]);
    }

    #[test]
    fn test_decode_status_rejects_bad_frames() {
        let mut frame = vec![0xFF, 0xFF, 3, 2, 0x00];
        let sum = checksum(&frame[2..]);
        frame.push(sum);
        assert!(decode_status(3, &frame).is_ok());

        assert!(matches!(
            decode_status(4, &frame),
            Err(FeetechError::InvalidResponse { id: 4, .. })
        ));

        let mut corrupted = frame.clone();
        corrupted[5] ^= 0x01;
        assert!(matches!(
            decode_status(3, &corrupted),
            Err(FeetechError::ChecksumMismatch { id: 3 })
        ));

        let mut faulted = vec![0xFF, 0xFF, 3, 2, 0x20];
        let sum = checksum(&faulted[2..]);
        faulted.push(sum);
        assert!(matches!(
            decode_status(3, &faulted),
            Err(FeetechError::ServoError { id: 3, status: 0x20 })
        ));
    }

    #[test]
    fn test_sign_magnitude() {
        assert_eq!(encode_sign_magnitude(100), 100);
        assert_eq!(encode_sign_magnitude(-100), 0x8064);
        assert_eq!(encode_sign_magnitude(i16::MIN), 0xFFFF);
        assert_eq!(decode_sign_magnitude(0x8064), -100);
        assert_eq!(decode_sign_magnitude(0x0001), 1);
    }
}
