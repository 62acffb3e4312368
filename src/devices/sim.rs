//! Simulated device served by the daemon when no real device class is wired in.

use std::time::Instant;

use crate::data::{AttrData, AttrDataType, AttrDim, AttrWriteType, AttributeValue, CmdValue, DevState};
use crate::devices::{AttrInfo, CmdInfo, DeviceBackend};
use crate::error::DevError;

/// A device with a drifting temperature, a counter and a small spectrum.
pub struct SimDevice {
    started: Instant,
    counter: i32,
    setpoint: f64,
    state: DevState,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counter: 0,
            setpoint: 20.0,
            state: DevState::On,
        }
    }

    fn temperature(&self) -> f64 {
        let t = self.started.elapsed().as_secs_f64();
        self.setpoint + (t / 10.0).sin()
    }

    fn read_one(&mut self, name: &str) -> Result<AttributeValue, DevError> {
        let data = match name.to_lowercase().as_str() {
            "temperature" => AttrData::Double(vec![self.temperature()]),
            "setpoint" => AttrData::Double(vec![self.setpoint]),
            "counter" => {
                self.counter += 1;
                AttrData::Long(vec![self.counter])
            }
            "spectrum" => {
                let base = self.temperature();
                let values: Vec<f64> = (0..8).map(|i| base + i as f64).collect();
                let dim_x = values.len() as u32;
                let mut value = AttributeValue::scalar("spectrum", AttrData::Double(values));
                value.r_dim = AttrDim { dim_x, dim_y: 0 };
                return Ok(value);
            }
            _ => {
                return Err(DevError::new(
                    "API_AttrNotFound",
                    format!("Attribute {name} not found"),
                    "SimDevice::read_attributes",
                ))
            }
        };
        Ok(AttributeValue::scalar(name, data))
    }
}

impl DeviceBackend for SimDevice {
    fn commands(&self) -> Vec<CmdInfo> {
        vec![
            CmdInfo::void("Reset"),
            CmdInfo::void("GetCounter"),
            CmdInfo::with_argin("SetSetpoint"),
        ]
    }

    fn attributes(&self) -> Vec<AttrInfo> {
        vec![
            AttrInfo::scalar("temperature", AttrDataType::DevDouble),
            AttrInfo::scalar("setpoint", AttrDataType::DevDouble)
                .writable(AttrWriteType::ReadWrite),
            AttrInfo::scalar("counter", AttrDataType::DevLong),
            AttrInfo::spectrum("spectrum", AttrDataType::DevDouble),
        ]
    }

    fn command_inout(&mut self, name: &str, argin: &CmdValue) -> Result<CmdValue, DevError> {
        match (name.to_lowercase().as_str(), argin) {
            ("reset", _) => {
                self.counter = 0;
                Ok(CmdValue::Void)
            }
            ("getcounter", _) => Ok(CmdValue::Long(self.counter)),
            ("setsetpoint", CmdValue::Double(v)) => {
                self.setpoint = *v;
                Ok(CmdValue::Void)
            }
            ("setsetpoint", other) => Err(DevError::new(
                "API_IncompatibleCmdArgumentType",
                format!("SetSetpoint expects a double, got {other:?}"),
                "SimDevice::command_inout",
            )),
            _ => Err(DevError::new(
                "API_CommandNotFound",
                format!("Command {name} not found"),
                "SimDevice::command_inout",
            )),
        }
    }

    fn read_attributes(&mut self, names: &[String]) -> Vec<Result<AttributeValue, DevError>> {
        names.iter().map(|n| self.read_one(n)).collect()
    }

    fn state(&mut self) -> Result<DevState, DevError> {
        Ok(self.state)
    }
}
