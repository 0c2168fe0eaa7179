//! Outbound frame encoders for the tank controller board
//!
//! Grammar (newline-terminated ASCII):
//! - `RELAY:<0|1>`: heater relay
//! - `MOTOR:<A|B>:<F|B|S>:<speed>`: full-state motor command
//!
//! Motor frames are always complete snapshots, never deltas: any change while
//! the motor runs re-derives direction and speed from current actuator state,
//! and a stop is the literal mode `S` with speed forced to `0`.

use crate::telemetry::{Motor, MotorState};

/// Frame for the binary heater relay.
pub fn relay_frame(on: bool) -> String {
    format!("RELAY:{}\n", if on { 1 } else { 0 })
}

/// Full-state frame for one motor, derived from its current commanded state.
pub fn motor_frame(motor: Motor, state: &MotorState) -> String {
    if state.running {
        format!(
            "MOTOR:{}:{}:{}\n",
            motor.code(),
            state.direction.code(),
            state.speed
        )
    } else {
        format!("MOTOR:{}:S:0\n", motor.code())
    }
}
