//! TMCL instruction exchange over a fixed-length framed connection.

use crate::motion::{Motion, MotionControl};
use async_trait::async_trait;
use saxs_core::protocol::frame::{self, instruction, Frame};
use saxs_core::{with_retry, Connection, CoreError, CoreResult, RetryPolicy};

/// Axis parameter numbers for SAP/GAP.
pub mod param {
    /// Target position of the current move.
    pub const TARGET_POSITION: u8 = 0;
    /// Actual position in microsteps.
    pub const ACTUAL_POSITION: u8 = 1;
    /// Target speed.
    pub const TARGET_SPEED: u8 = 2;
    /// Actual speed, zero when standing still.
    pub const ACTUAL_SPEED: u8 = 3;
    /// Maximum positioning speed.
    pub const MAX_SPEED: u8 = 4;
    /// Maximum acceleration.
    pub const MAX_ACCELERATION: u8 = 5;
    /// Absolute maximum current.
    pub const MAX_CURRENT: u8 = 6;
    /// 1 once the target position is reached.
    pub const POSITION_REACHED: u8 = 8;
    /// Right limit switch state.
    pub const RIGHT_LIMIT: u8 = 10;
    /// Left limit switch state.
    pub const LEFT_LIMIT: u8 = 11;
}

fn mnemonic(code: u8) -> &'static str {
    match code {
        instruction::ROR => "ROR",
        instruction::ROL => "ROL",
        instruction::MST => "MST",
        instruction::MVP => "MVP",
        instruction::SAP => "SAP",
        instruction::GAP => "GAP",
        instruction::STAP => "STAP",
        instruction::GGP => "GGP",
        instruction::FIRMWARE => "firmware",
        _ => "TMCL",
    }
}

/// Instruction-level client for one controller module.
#[derive(Debug, Clone)]
pub struct Tmcl {
    conn: Connection,
    module: u8,
    retry: RetryPolicy,
}

impl Tmcl {
    /// Client for module `module` on `conn`.
    pub fn new(conn: Connection, module: u8, retry: RetryPolicy) -> Self {
        Self {
            conn,
            module,
            retry,
        }
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Send one instruction and return the reply value.
    ///
    /// Timeouts and frame integrity errors are retried per the policy. A
    /// non-success status becomes [`CoreError::DeviceRejected`].
    pub async fn exchange(&self, code: u8, kind: u8, motor: u8, value: i32) -> CoreResult<i32> {
        let request = Frame::new(self.module, code, kind, motor, value);
        let bytes = request.encode();
        let label = mnemonic(code);
        let reply = with_retry(&self.retry, label, |_| {
            self.conn.execute(&bytes, label, frame::matcher(request))
        })
        .await?;
        reply.outcome().map_err(|rejection| {
            tracing::warn!(
                instrument = %self.conn.name(),
                instruction = label,
                motor,
                kind,
                %rejection,
                "Controller rejected instruction"
            );
            CoreError::rejected(self.conn.name(), format!("{label}: {rejection}"))
        })
    }

    /// Rotate right at `velocity`.
    pub async fn rotate_right(&self, motor: u8, velocity: i32) -> CoreResult<()> {
        self.exchange(instruction::ROR, 0, motor, velocity).await.map(drop)
    }

    /// Rotate left at `velocity`.
    pub async fn rotate_left(&self, motor: u8, velocity: i32) -> CoreResult<()> {
        self.exchange(instruction::ROL, 0, motor, velocity).await.map(drop)
    }

    /// Stop the motor.
    pub async fn stop(&self, motor: u8) -> CoreResult<()> {
        self.exchange(instruction::MST, 0, motor, 0).await.map(drop)
    }

    /// Start a move to `position` (absolute) or by `position` (relative).
    pub async fn move_to(&self, motor: u8, position: i32, relative: bool) -> CoreResult<()> {
        self.exchange(instruction::MVP, u8::from(relative), motor, position)
            .await
            .map(drop)
    }

    /// Write an axis parameter.
    pub async fn set_axis_parameter(&self, motor: u8, parameter: u8, value: i32) -> CoreResult<()> {
        self.exchange(instruction::SAP, parameter, motor, value)
            .await
            .map(drop)
    }

    /// Read an axis parameter.
    pub async fn axis_parameter(&self, motor: u8, parameter: u8) -> CoreResult<i32> {
        self.exchange(instruction::GAP, parameter, motor, 0).await
    }

    /// Module type and firmware version, e.g. `6110V1.19`.
    pub async fn firmware(&self) -> CoreResult<String> {
        let raw = self.exchange(instruction::FIRMWARE, 1, 0, 0).await?;
        let [hi, lo, major, minor] = raw.to_be_bytes();
        Ok(format!("{}V{major}.{minor:02}", u16::from_be_bytes([hi, lo])))
    }
}

#[async_trait]
impl MotionControl for Tmcl {
    fn instrument(&self) -> &str {
        self.conn.name()
    }

    async fn position(&self, axis: u8) -> CoreResult<i32> {
        self.axis_parameter(axis, param::ACTUAL_POSITION).await
    }

    async fn start(&self, axis: u8, motion: Motion) -> CoreResult<()> {
        match motion {
            Motion::Absolute(target) => self.move_to(axis, target, false).await,
            Motion::Relative(distance) => self.move_to(axis, distance, true).await,
            Motion::RotateRight(velocity) => self.rotate_right(axis, velocity).await,
            Motion::RotateLeft(velocity) => self.rotate_left(axis, velocity).await,
        }
    }

    async fn is_idle(&self, axis: u8, motion: Motion) -> CoreResult<bool> {
        match motion {
            Motion::Absolute(_) | Motion::Relative(_) => Ok(self
                .axis_parameter(axis, param::POSITION_REACHED)
                .await?
                != 0),
            Motion::RotateRight(_) | Motion::RotateLeft(_) => {
                Ok(self.axis_parameter(axis, param::ACTUAL_SPEED).await? == 0)
            }
        }
    }

    async fn stop(&self, axis: u8) -> CoreResult<()> {
        Tmcl::stop(self, axis).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonics() {
        assert_eq!(mnemonic(instruction::MVP), "MVP");
        assert_eq!(mnemonic(instruction::FIRMWARE), "firmware");
        assert_eq!(mnemonic(200), "TMCL");
    }
}
